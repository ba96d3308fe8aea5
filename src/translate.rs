//! Cross-database reference translation.
//!
//! Rewrites SQL text so that `database.dbo.table` references to catalogs
//! living on other servers gain their configured linked-server alias:
//! `Archive.dbo.Logs` becomes `ARC01.Archive.dbo.Logs` when `Archive` is
//! a linked catalog. References that are already server-qualified, name a
//! local database, or sit inside string literals or comments are left
//! untouched, which also makes the rewrite idempotent.
//!
//! This is a narrow textual rewrite over a minimal scanner, not a SQL
//! parser: it understands single-quoted literals, `--` line comments,
//! nested `/* */` block comments, and one layer of `[...]` identifier
//! quoting, and nothing else.

use std::collections::HashMap;

use crate::config::ConfigSource;

/// The schema segment the rewrite keys on. The schema name is fixed to
/// `dbo` and the match is case-sensitive.
const NEEDLE: &str = ".dbo.";

/// Translates cross-database references against a linked-server catalog.
#[derive(Debug, Clone, Default)]
pub struct LinkedServerTranslator {
    /// Lowercased names of databases local to the connected server.
    local_databases: Vec<String>,
    /// Lowercased catalog name to linked-server alias.
    linked_servers: HashMap<String, String>,
}

impl LinkedServerTranslator {
    /// Creates a translator from explicit database lists.
    pub fn new(
        local_databases: impl IntoIterator<Item = String>,
        linked_servers: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            local_databases: local_databases
                .into_iter()
                .map(|d| d.to_lowercase())
                .collect(),
            linked_servers: linked_servers
                .into_iter()
                .map(|(db, alias)| (db.to_lowercase(), alias))
                .collect(),
        }
    }

    /// Creates a translator from a configuration source.
    pub fn from_config(config: &dyn ConfigSource) -> Self {
        Self::new(config.local_databases(), config.linked_servers())
    }

    /// Adds a linked-server alias for a catalog.
    pub fn add_linked_server(&mut self, database: &str, alias: &str) {
        self.linked_servers
            .insert(database.to_lowercase(), alias.to_string());
    }

    /// Adds a database known to be local.
    pub fn add_local_database(&mut self, database: &str) {
        self.local_databases.push(database.to_lowercase());
    }

    /// Rewrites `database.dbo.table` references, inserting the linked
    /// server alias before every known non-local catalog name.
    pub fn translate(&self, sql: &str) -> String {
        let mut out = sql.to_string();
        // Right to left so earlier byte positions survive the inserts.
        for position in find_needles(sql).into_iter().rev() {
            if let Some((insert_at, alias)) = self.qualification(&out[..position]) {
                out.insert_str(insert_at, &format!("{alias}."));
            }
        }
        out
    }

    /// Decides whether the identifier preceding a `.dbo.` occurrence
    /// needs qualification. Returns the insert position and the alias.
    fn qualification(&self, prefix: &str) -> Option<(usize, String)> {
        let (start, identifier) = preceding_identifier(prefix)?;
        // A dot immediately before the identifier means it is already
        // server-qualified; leave it alone.
        if start > 0 && prefix.as_bytes()[start - 1] == b'.' {
            return None;
        }
        let key = identifier.to_lowercase();
        if self.local_databases.contains(&key) {
            return None;
        }
        let alias = self.linked_servers.get(&key)?;
        Some((start, alias.clone()))
    }
}

/// Extracts the identifier ending at the end of `prefix`: a bracketed
/// `[name]` (exactly one layer stripped) or a bare run of identifier
/// characters. Returns its byte start and text, or `None` when there is
/// no identifier or the bracket sequence is malformed.
fn preceding_identifier(prefix: &str) -> Option<(usize, &str)> {
    let bytes = prefix.as_bytes();
    if bytes.last() == Some(&b']') {
        // One layer of [...]; no matching bracket means malformed input
        // that is deliberately left unmodified.
        let open = prefix.rfind('[')?;
        let inner = &prefix[open + 1..prefix.len() - 1];
        if inner.is_empty() {
            return None;
        }
        return Some((open, inner));
    }

    let mut start = prefix.len();
    while start > 0 && is_ident_byte(bytes[start - 1]) {
        start -= 1;
    }
    if start == prefix.len() {
        return None;
    }
    Some((start, &prefix[start..]))
}

fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'#' | b'$' | b'@') || byte >= 0x80
}

/// Scanner state while looking for `.dbo.` occurrences.
enum Mode {
    Normal,
    StringLiteral,
    LineComment,
    /// T-SQL block comments nest; the depth is tracked.
    BlockComment(u32),
}

/// Byte positions of every `.dbo.` occurrence outside string literals
/// and comments.
fn find_needles(sql: &str) -> Vec<usize> {
    let bytes = sql.as_bytes();
    let mut positions = Vec::new();
    let mut mode = Mode::Normal;
    let mut i = 0;

    while i < bytes.len() {
        match mode {
            Mode::Normal => {
                if bytes[i] == b'\'' {
                    mode = Mode::StringLiteral;
                } else if bytes[i..].starts_with(b"--") {
                    mode = Mode::LineComment;
                    i += 1;
                } else if bytes[i..].starts_with(b"/*") {
                    mode = Mode::BlockComment(1);
                    i += 1;
                } else if bytes[i..].starts_with(NEEDLE.as_bytes()) {
                    positions.push(i);
                    // The trailing dot may start the next occurrence
                    // (`a.dbo.dbo.b`), so do not skip past it.
                    i += NEEDLE.len() - 2;
                }
            }
            Mode::StringLiteral => {
                if bytes[i] == b'\'' {
                    if bytes.get(i + 1) == Some(&b'\'') {
                        i += 1; // escaped quote
                    } else {
                        mode = Mode::Normal;
                    }
                }
            }
            Mode::LineComment => {
                if bytes[i] == b'\n' {
                    mode = Mode::Normal;
                }
            }
            Mode::BlockComment(depth) => {
                if bytes[i..].starts_with(b"/*") {
                    mode = Mode::BlockComment(depth + 1);
                    i += 1;
                } else if bytes[i..].starts_with(b"*/") {
                    mode = if depth == 1 {
                        Mode::Normal
                    } else {
                        Mode::BlockComment(depth - 1)
                    };
                    i += 1;
                }
            }
        }
        i += 1;
    }
    positions
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn translator() -> LinkedServerTranslator {
        LinkedServerTranslator::new(
            vec!["app".to_string()],
            vec![("archive".to_string(), "ARC01".to_string())],
        )
    }

    #[test]
    fn test_linked_catalog_gains_alias() {
        let sql = "SELECT * FROM Archive.dbo.Logs";
        assert_eq!(
            translator().translate(sql),
            "SELECT * FROM ARC01.Archive.dbo.Logs"
        );
    }

    #[test]
    fn test_translation_is_idempotent() {
        let t = translator();
        let once = t.translate("SELECT * FROM Archive.dbo.Logs WHERE x = 1");
        let twice = t.translate(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_already_qualified_is_noop() {
        let sql = "SELECT * FROM ARC01.Archive.dbo.Logs";
        assert_eq!(translator().translate(sql), sql);
    }

    #[test]
    fn test_local_database_untouched() {
        let sql = "SELECT * FROM App.dbo.Users";
        assert_eq!(translator().translate(sql), sql);
    }

    #[test]
    fn test_unknown_database_untouched() {
        let sql = "SELECT * FROM Mystery.dbo.Things";
        assert_eq!(translator().translate(sql), sql);
    }

    #[test]
    fn test_bracketed_identifier() {
        let sql = "SELECT * FROM [Archive].dbo.Logs";
        assert_eq!(
            translator().translate(sql),
            "SELECT * FROM ARC01.[Archive].dbo.Logs"
        );
        // And qualified bracketed form stays put.
        let qualified = "SELECT * FROM ARC01.[Archive].dbo.Logs";
        assert_eq!(translator().translate(qualified), qualified);
    }

    #[test]
    fn test_malformed_bracket_left_unmodified() {
        let sql = "SELECT * FROM Archive].dbo.Logs";
        assert_eq!(translator().translate(sql), sql);
    }

    #[test]
    fn test_string_literals_and_comments_immune() {
        let t = translator();
        let sql = "SELECT 'Archive.dbo.Logs' FROM Archive.dbo.Logs -- Archive.dbo.Logs";
        assert_eq!(
            t.translate(sql),
            "SELECT 'Archive.dbo.Logs' FROM ARC01.Archive.dbo.Logs -- Archive.dbo.Logs"
        );

        let block = "/* Archive.dbo.Logs /* nested */ still comment */ SELECT 1";
        assert_eq!(t.translate(block), block);

        let escaped = "SELECT 'it''s Archive.dbo.Logs here'";
        assert_eq!(t.translate(escaped), escaped);
    }

    #[test]
    fn test_multiple_occurrences() {
        let sql = "SELECT a.x FROM Archive.dbo.A a JOIN App.dbo.B b ON a.id = b.id \
                   JOIN Archive.dbo.C c ON c.id = a.id";
        let expected = "SELECT a.x FROM ARC01.Archive.dbo.A a JOIN App.dbo.B b ON a.id = b.id \
                   JOIN ARC01.Archive.dbo.C c ON c.id = a.id";
        assert_eq!(translator().translate(sql), expected);
    }

    #[test]
    fn test_needle_with_no_identifier() {
        let sql = ".dbo.Logs";
        assert_eq!(translator().translate(sql), sql);
    }

    #[test]
    fn test_lookup_is_case_insensitive_needle_is_not() {
        let t = translator();
        assert_eq!(
            t.translate("SELECT * FROM ARCHIVE.dbo.Logs"),
            "SELECT * FROM ARC01.ARCHIVE.dbo.Logs"
        );
        // Schema segment match is case-sensitive by design.
        let upper = "SELECT * FROM Archive.DBO.Logs";
        assert_eq!(t.translate(upper), upper);
    }
}
