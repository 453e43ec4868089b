pub mod backend;
pub mod consolidator;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod plan;
pub mod pool;
pub mod querylist;
pub mod rowcache;
pub mod rules;
pub mod schema;
pub mod sqlgen;
pub mod sqltypes;
pub mod stats;
pub mod tx;
