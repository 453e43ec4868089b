//! Policy gate: query rules and table ACLs.
//!
//! Rules let operators block or throttle traffic by caller address, username
//! and bind-variable values without restarting the tablet. ACLs restrict
//! who may touch a table; whether an ACL failure is terminal depends on the
//! engine's strict flag.

use std::collections::HashSet;

use crate::sqlgen::{BindValue, BindVars};
use crate::sqltypes::Value;

/// Outcome of matching a request against the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No rule matched; continue executing.
    Continue,
    /// Reject terminally.
    Fail,
    /// Reject, but the client may retry.
    FailRetry,
}

/// Comparison applied to a bind variable named by a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum BindVarOp {
    /// Match on presence alone.
    Noop,
    /// Numeric equality.
    Eq(i64),
    /// Numeric inequality.
    Ne(i64),
    /// Numeric less-than.
    Lt(i64),
    /// Numeric greater-than.
    Gt(i64),
}

/// A condition over one bind variable.
#[derive(Debug, Clone, PartialEq)]
pub struct BindVarCond {
    /// Bind variable name the condition inspects.
    pub name: String,
    /// When true the condition matches if the bind is absent; when false it
    /// matches if the bind is present and the operator holds.
    pub on_absent: bool,
    /// Operator applied when the bind is present.
    pub op: BindVarOp,
}

impl BindVarCond {
    fn matches(&self, bind_vars: &BindVars) -> bool {
        let Some(value) = bind_vars.get(&self.name) else {
            return self.on_absent;
        };
        if self.on_absent {
            return false;
        }
        match &self.op {
            BindVarOp::Noop => true,
            op => {
                let Some(n) = as_int(value) else {
                    return false;
                };
                match op {
                    BindVarOp::Eq(want) => n == *want,
                    BindVarOp::Ne(want) => n != *want,
                    BindVarOp::Lt(want) => n < *want,
                    BindVarOp::Gt(want) => n > *want,
                    BindVarOp::Noop => unreachable!(),
                }
            }
        }
    }
}

fn as_int(value: &BindValue) -> Option<i64> {
    match value {
        BindValue::Value(Value::Int(n)) => Some(*n),
        BindValue::Value(Value::UInt(n)) => i64::try_from(*n).ok(),
        _ => None,
    }
}

/// One operator-configured rule.
#[derive(Debug, Clone)]
pub struct QueryRule {
    /// Short rule name, surfaced in error messages.
    pub name: String,
    /// Longer description for operators.
    pub description: String,
    /// Caller address pattern (`None` = any). A trailing `%` makes it a
    /// prefix match, otherwise the match is exact.
    pub requesting_addr: Option<String>,
    /// Username pattern, same matching rules as the address.
    pub user: Option<String>,
    /// All conditions must hold for the rule to match.
    pub bindvar_conds: Vec<BindVarCond>,
    /// What to do when the rule matches.
    pub action: Action,
}

impl QueryRule {
    /// Creates a rule matching everything, with the given action.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        action: Action,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            requesting_addr: None,
            user: None,
            bindvar_conds: Vec::new(),
            action,
        }
    }

    fn matches(&self, addr: &str, user: &str, bind_vars: &BindVars) -> bool {
        if let Some(pat) = &self.requesting_addr
            && !pattern_matches(pat, addr)
        {
            return false;
        }
        if let Some(pat) = &self.user
            && !pattern_matches(pat, user)
        {
            return false;
        }
        self.bindvar_conds.iter().all(|c| c.matches(bind_vars))
    }
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('%') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// The active rule set for a plan. The first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct QueryRules {
    rules: Vec<QueryRule>,
}

impl QueryRules {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule; earlier rules take precedence.
    pub fn add(&mut self, rule: QueryRule) {
        self.rules.push(rule);
    }

    /// Matches the request against the rules. Returns the action and, for a
    /// match, the rule's description for the error message.
    pub fn get_action(&self, addr: &str, user: &str, bind_vars: &BindVars) -> (Action, &str) {
        for rule in &self.rules {
            if rule.matches(addr, user, bind_vars) {
                return (rule.action, &rule.description);
            }
        }
        (Action::Continue, "")
    }
}

/// A named set of principals allowed to run a statement on a table.
#[derive(Debug, Clone)]
pub struct Acl {
    /// ACL name, for diagnostics.
    pub name: String,
    members: HashSet<String>,
}

impl Acl {
    /// Creates an ACL from a member list.
    pub fn new(name: impl Into<String>, members: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            members: members.into_iter().collect(),
        }
    }

    /// Whether the user belongs to this ACL.
    pub fn is_member(&self, user: &str) -> bool {
        self.members.contains(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bv(pairs: &[(&str, i64)]) -> BindVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), BindValue::Value(Value::Int(*v))))
            .collect()
    }

    #[test]
    fn test_empty_rules_continue() {
        let rules = QueryRules::new();
        let (action, _) = rules.get_action("1.2.3.4", "alice", &BindVars::new());
        assert_eq!(action, Action::Continue);
    }

    #[test]
    fn test_user_match() {
        let mut rules = QueryRules::new();
        let mut rule = QueryRule::new("block_bob", "bob is blocked", Action::Fail);
        rule.user = Some("bob".into());
        rules.add(rule);

        let (action, desc) = rules.get_action("", "bob", &BindVars::new());
        assert_eq!(action, Action::Fail);
        assert_eq!(desc, "bob is blocked");

        let (action, _) = rules.get_action("", "alice", &BindVars::new());
        assert_eq!(action, Action::Continue);
    }

    #[test]
    fn test_addr_prefix_match() {
        let mut rules = QueryRules::new();
        let mut rule = QueryRule::new("block_net", "blocked subnet", Action::FailRetry);
        rule.requesting_addr = Some("10.1.%".into());
        rules.add(rule);

        assert_eq!(
            rules.get_action("10.1.2.3", "", &BindVars::new()).0,
            Action::FailRetry
        );
        assert_eq!(
            rules.get_action("10.2.2.3", "", &BindVars::new()).0,
            Action::Continue
        );
    }

    #[test]
    fn test_bindvar_conds() {
        let mut rules = QueryRules::new();
        let mut rule = QueryRule::new("hot_row", "hot row blocked", Action::Fail);
        rule.bindvar_conds.push(BindVarCond {
            name: "id".into(),
            on_absent: false,
            op: BindVarOp::Eq(42),
        });
        rules.add(rule);

        assert_eq!(
            rules.get_action("", "", &bv(&[("id", 42)])).0,
            Action::Fail
        );
        assert_eq!(
            rules.get_action("", "", &bv(&[("id", 7)])).0,
            Action::Continue
        );
        // Absent bind does not match a present-shaped condition.
        assert_eq!(
            rules.get_action("", "", &BindVars::new()).0,
            Action::Continue
        );
    }

    #[test]
    fn test_bindvar_on_absent() {
        let mut rules = QueryRules::new();
        let mut rule = QueryRule::new("require_id", "id required", Action::Fail);
        rule.bindvar_conds.push(BindVarCond {
            name: "id".into(),
            on_absent: true,
            op: BindVarOp::Noop,
        });
        rules.add(rule);

        assert_eq!(rules.get_action("", "", &BindVars::new()).0, Action::Fail);
        assert_eq!(
            rules.get_action("", "", &bv(&[("id", 1)])).0,
            Action::Continue
        );
    }

    #[test]
    fn test_first_match_wins() {
        let mut rules = QueryRules::new();
        rules.add(QueryRule::new("first", "first", Action::FailRetry));
        rules.add(QueryRule::new("second", "second", Action::Fail));
        let (action, desc) = rules.get_action("", "", &BindVars::new());
        assert_eq!(action, Action::FailRetry);
        assert_eq!(desc, "first");
    }

    #[test]
    fn test_acl_membership() {
        let acl = Acl::new("writers", ["alice".to_string(), "bob".to_string()]);
        assert!(acl.is_member("alice"));
        assert!(!acl.is_member("mallory"));
    }
}
