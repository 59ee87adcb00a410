//! SQL text used by the engine.
//!
//! Identifiers never reach a statement unquoted: table and trigger names go
//! through [`quote_ident`] / [`quote_table`], and the channel name must also
//! pass [`validate_identifier`]. Query parameters travel as bind values.

use crate::error::{LiveError, Result};

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a table reference that may be schema-qualified (`schema.table`).
pub fn quote_table(table: &str) -> String {
    match table.split_once('.') {
        Some((schema, name)) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
        None => quote_ident(table),
    }
}

/// Allow-list check for names that are embedded in generated identifiers:
/// ASCII letters, digits and underscores, not starting with a digit.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_first && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(LiveError::InvalidArgument(format!(
            "'{name}' is not a plain identifier"
        )))
    }
}

/// Name of the trigger installed on `table` for `channel`.
pub fn trigger_name(channel: &str, table: &str) -> String {
    format!("{channel}_{}", table.replace('.', "_"))
}

pub fn listen(channel: &str) -> String {
    format!("LISTEN {}", quote_ident(channel))
}

pub fn unlisten(channel: &str) -> String {
    format!("UNLISTEN {}", quote_ident(channel))
}

pub fn drop_trigger(trigger: &str, table: &str) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {} ON {}",
        quote_ident(trigger),
        quote_table(table)
    )
}

pub fn create_trigger(trigger: &str, table: &str, function: &str) -> String {
    format!(
        "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {} \
         FOR EACH ROW EXECUTE PROCEDURE {}()",
        quote_ident(trigger),
        quote_table(table),
        quote_ident(function)
    )
}

pub fn drop_function(function: &str) -> String {
    format!("DROP FUNCTION IF EXISTS {}() CASCADE", quote_ident(function))
}

/// Shared trigger function. Builds the JSON change notice for the affected
/// row and publishes it on `channel` in parts of at most `chunk_chars`
/// characters, shaped `msgId:count:index:chunk`.
pub fn create_function(function: &str, channel: &str, chunk_chars: usize) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $livepg$
DECLARE
  payload TEXT;
  msg_id TEXT;
  part_count INT;
BEGIN
  IF TG_OP = 'INSERT' THEN
    payload := json_build_object('table', TG_TABLE_NAME, 'schema', TG_TABLE_SCHEMA,
      'database', current_database(), 'op', TG_OP, 'data', json_build_array(row_to_json(NEW)))::text;
  ELSIF TG_OP = 'DELETE' THEN
    payload := json_build_object('table', TG_TABLE_NAME, 'schema', TG_TABLE_SCHEMA,
      'database', current_database(), 'op', TG_OP, 'data', json_build_array(row_to_json(OLD)))::text;
  ELSE
    payload := json_build_object('table', TG_TABLE_NAME, 'schema', TG_TABLE_SCHEMA,
      'database', current_database(), 'op', TG_OP, 'new_data', json_build_array(row_to_json(NEW)),
      'old_data', json_build_array(row_to_json(OLD)))::text;
  END IF;
  msg_id := md5(payload || clock_timestamp()::text || random()::text);
  part_count := GREATEST(CEIL(char_length(payload)::numeric / {chunk_chars}), 1);
  FOR i IN 1..part_count LOOP
    PERFORM pg_notify({channel}, msg_id || ':' || part_count || ':' || i || ':' ||
      substr(payload, (i - 1) * {chunk_chars} + 1, {chunk_chars}));
  END LOOP;
  RETURN NULL;
END;
$livepg$ LANGUAGE plpgsql"#,
        function = quote_ident(function),
        channel = quote_literal(channel),
        chunk_chars = chunk_chars.max(1),
    )
}

/// Wrap a live query so PostgreSQL returns every result row with a content
/// hash, in result order. Rows whose hash appears in the array bound at
/// `$hash_param` come back with `_data` NULL; the caller already holds them.
pub fn refresh_query(query: &str, hash_param: usize) -> String {
    format!(
        "WITH livepg_res AS ({query}), \
         livepg_rows AS (\
           SELECT to_jsonb(livepg_res.*) AS _row, ROW_NUMBER() OVER () AS _index FROM livepg_res\
         ) \
         SELECT md5(_row::text) AS _hash, \
           CASE WHEN md5(_row::text) = ANY(${hash_param}::text[]) THEN NULL ELSE _row END AS _data \
         FROM livepg_rows ORDER BY _index"
    )
}

/// Plan query used to discover the relations a live query reads.
pub fn explain_query(query: &str) -> String {
    format!("EXPLAIN (FORMAT JSON) {query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_table() {
        assert_eq!(quote_table("public.users"), "\"public\".\"users\"");
        assert_eq!(quote_table("users"), "\"users\"");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("live_channel_1").is_ok());
        assert!(validate_identifier("_x").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("a-b").is_err());
        assert!(validate_identifier("a\"; DROP").is_err());
    }

    #[test]
    fn test_trigger_ddl_quotes_everything() {
        let name = trigger_name("chan", "public.users");
        assert_eq!(name, "chan_public_users");
        assert_eq!(
            drop_trigger(&name, "public.users"),
            "DROP TRIGGER IF EXISTS \"chan_public_users\" ON \"public\".\"users\""
        );
        let create = create_trigger("chan_users", "users", "livepg_chan");
        assert!(create.starts_with("CREATE TRIGGER \"chan_users\" AFTER INSERT OR UPDATE OR DELETE ON \"users\""));
        assert!(create.ends_with("EXECUTE PROCEDURE \"livepg_chan\"()"));
    }

    #[test]
    fn test_hostile_table_name_stays_quoted() {
        let ddl = drop_trigger("t", "x\" ON y; DROP TABLE users; --");
        assert!(ddl.contains("\"x\"\" ON y; DROP TABLE users; --\""));
    }

    #[test]
    fn test_create_function_template() {
        let sql = create_function("livepg_chan", "chan", 1900);
        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION \"livepg_chan\"()"));
        assert!(sql.contains("pg_notify('chan',"));
        assert!(sql.contains("/ 1900"));
    }

    #[test]
    fn test_refresh_query_uses_hash_param() {
        let sql = refresh_query("SELECT id, name FROM users WHERE org = $1", 2);
        assert!(sql.contains("WITH livepg_res AS (SELECT id, name FROM users WHERE org = $1)"));
        assert!(sql.contains("ANY($2::text[])"));
        assert!(sql.contains("ORDER BY _index"));
    }

    #[test]
    fn test_listen() {
        assert_eq!(listen("chan"), "LISTEN \"chan\"");
        assert_eq!(unlisten("chan"), "UNLISTEN \"chan\"");
        assert_eq!(drop_function("f"), "DROP FUNCTION IF EXISTS \"f\"() CASCADE");
    }
}
