//! SQL resources for the result store.
//!
//! The statements are loaded once from external `.sql` resources; this
//! module is the only ambient source of SQL for the store.

/// Creates the results table.
pub const CREATE_RESULTS_TABLE: &str = include_str!("sql/create_results_table.sql");

/// Inserts one result row.
pub const INSERT_RESULT: &str = include_str!("sql/insert_result.sql");

/// Selects the rows of one execution.
pub const SELECT_RESULTS: &str = include_str!("sql/select_results.sql");

/// The results table name.
pub const RESULTS_TABLE: &str = "results";

/// Returns all bootstrap statements in execution order.
pub fn bootstrap_statements() -> Vec<&'static str> {
    vec![CREATE_RESULTS_TABLE]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_loaded() {
        assert!(CREATE_RESULTS_TABLE.contains("CREATE TABLE IF NOT EXISTS results"));
        assert!(INSERT_RESULT.contains("INSERT INTO results"));
        assert!(SELECT_RESULTS.contains("WHERE instance_id = ?1"));
    }

    #[test]
    fn test_column_order_matches_layout() {
        // The persisted column order is part of the store's contract.
        let expected = [
            "instance_id",
            "source_file_name",
            "source_file_type",
            "source_file_id",
            "source_file_size",
            "file_id",
            "file_size",
            "file_type",
            "file_name",
            "file_path",
            "source_file_modify_time",
            "status",
            "operator_id",
            "error_code",
            "incremental",
            "child_id",
            "slice_num",
        ];
        let mut last = 0;
        for column in expected {
            let pos = CREATE_RESULTS_TABLE
                .find(column)
                .unwrap_or_else(|| panic!("column {column} missing from schema"));
            assert!(pos > last, "column {column} out of order");
            last = pos;
        }
    }

    #[test]
    fn test_bootstrap_statement_order() {
        let statements = bootstrap_statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains(RESULTS_TABLE));
    }
}
