//! Backend-specific object parsing and capabilities.
//!
//! The engine and journal never branch on the backend. Everything that differs between
//! databases (quoting, parameter syntax, catalog queries, whether DDL can be rolled back) is
//! asked of a [Dialect].

/// Quoting rules and capabilities of one database backend.
pub trait Dialect {
    /// Short backend name, used in log output.
    fn name(&self) -> &'static str;

    /// Quote an identifier so it can be embedded in SQL text.
    /// The default uses ANSI double quotes, doubling any embedded quote.
    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    /// Quote an optionally schema-qualified table name.
    fn quote_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(table)
            ),
            None => self.quote_identifier(table),
        }
    }

    /// Positional parameter placeholder, 1-based.
    fn placeholder(&self, index: usize) -> String;

    /// A query returning a single count that is non-zero iff the table exists, along with its
    /// parameters.
    fn table_exists_query(&self, schema: Option<&str>, table: &str) -> (String, Vec<String>);

    /// Whether schema changes made inside a transaction are undone by a rollback.
    fn supports_transactional_ddl(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ansi;

    impl Dialect for Ansi {
        fn name(&self) -> &'static str {
            "ansi"
        }
        fn placeholder(&self, index: usize) -> String {
            format!("${index}")
        }
        fn table_exists_query(&self, _schema: Option<&str>, table: &str) -> (String, Vec<String>) {
            (
                "SELECT COUNT(*) FROM tables WHERE name = $1".to_string(),
                vec![table.to_string()],
            )
        }
        fn supports_transactional_ddl(&self) -> bool {
            false
        }
    }

    #[test]
    fn default_quoting_escapes_embedded_quotes() {
        assert_eq!(Ansi.quote_identifier("schema_versions"), "\"schema_versions\"");
        assert_eq!(Ansi.quote_identifier("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn schema_qualified_tables_quote_each_part() {
        assert_eq!(
            Ansi.quote_table(Some("audit"), "schema_versions"),
            "\"audit\".\"schema_versions\""
        );
        assert_eq!(Ansi.quote_table(None, "Foo"), "\"Foo\"");
    }
}
