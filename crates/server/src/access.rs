//! Project access policy.

use std::collections::HashSet;

/// A project as seen by the access check: its owner and collaborator set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub member_ids: HashSet<String>,
}

/// A user may act on a project iff they own it or are one of its members.
pub fn can_act(user_id: &str, project: &Project) -> bool {
    project.owner_id == user_id || project.member_ids.contains(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(owner: &str, members: &[&str]) -> Project {
        Project {
            id: "p1".into(),
            owner_id: owner.into(),
            member_ids: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn owner_can_act_without_being_a_member() {
        assert!(can_act("alice", &project("alice", &[])));
    }

    #[test]
    fn member_can_act() {
        assert!(can_act("bob", &project("alice", &["bob", "carol"])));
    }

    #[test]
    fn outsider_cannot_act() {
        let p = project("alice", &["bob"]);
        assert!(!can_act("mallory", &p));
        assert!(!can_act("", &p));
        assert!(!can_act("Alice", &p));
    }
}
