use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// A single integrity finding, located by logical file, row and column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub file: String,
    pub row: Option<usize>,
    pub column: Option<String>,
    pub message: String,
    pub severity: Severity,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file:{}", self.file)?;
        if let Some(row) = self.row {
            write!(f, ",row:{}", row)?;
        }
        if let Some(column) = &self.column {
            write!(f, ",column:{}", column)?;
        }
        write!(f, ",message:{}", self.message)
    }
}

/// Result of checking a project configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record an error. Rows are 1-based positions within `file`.
    pub fn error(&mut self, file: &str, row: Option<usize>, column: &str, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            file: file.to_string(),
            row,
            column: Some(column.to_string()),
            message: message.into(),
            severity: Severity::Error,
        });
    }

    pub fn warning(&mut self, file: &str, row: Option<usize>, column: &str, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            file: file.to_string(),
            row,
            column: Some(column.to_string()),
            message: message.into(),
            severity: Severity::Warning,
        });
    }

    /// One-line digest used in error messages
    pub fn summary(&self) -> String {
        match self.errors.first() {
            Some(first) if self.errors.len() == 1 => first.to_string(),
            Some(first) => format!("{} (and {} more)", first, self.errors.len() - 1),
            None => "no errors".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report_is_valid() {
        let report = ValidationReport::new();
        assert!(report.is_valid());
        assert_eq!(report.summary(), "no errors");
    }

    #[test]
    fn test_warnings_do_not_invalidate() {
        let mut report = ValidationReport::new();
        report.warning("machines", Some(1), "mtbf", "no repair time configured");
        assert!(report.is_valid());
    }

    #[test]
    fn test_summary_formats_location() {
        let mut report = ValidationReport::new();
        report.error("routes", Some(2), "yield_rate", "must be in (0,1]");
        report.error("routes", Some(3), "yield_rate", "must be in (0,1]");
        assert!(!report.is_valid());
        assert_eq!(
            report.summary(),
            "file:routes,row:2,column:yield_rate,message:must be in (0,1] (and 1 more)"
        );
    }
}
