pub const DEFAULT_DATABASE_ID: &str = "(default)";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_database() {
        let db = DatabaseId::default("project");
        assert_eq!(db.project_id(), "project");
        assert_eq!(db.database(), DEFAULT_DATABASE_ID);
        assert!(db.is_default_database());
        assert!(!DatabaseId::new("project", "other").is_default_database());
    }
}
