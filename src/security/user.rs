use std::collections::BTreeSet;

/// Principal on whose behalf a request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    name: String,
    roles: BTreeSet<String>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: BTreeSet::new(),
        }
    }

    /// Unauthenticated caller with no roles.
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Adds a role if it doesn't already exist
    pub fn add_role(&mut self, role: impl Into<String>) -> bool {
        self.roles.insert(role.into())
    }

    pub fn remove_role(&mut self, role: &str) -> bool {
        self.roles.remove(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_tracked() {
        let mut user = User::new("alice").with_role("editor");
        assert!(user.has_role("editor"));
        assert!(!user.has_role("admin"));

        assert!(user.add_role("admin"));
        assert!(!user.add_role("admin"));
        assert!(user.remove_role("editor"));
        assert_eq!(user.roles().collect::<Vec<_>>(), vec!["admin"]);
    }
}
