//! Newline-delimited JSON import and export, so the embedded backends can be
//! seeded from (and inspected with) plain files.

use std::io::{BufRead, Write};

use serde_json::Value;
use store::{Document, DocumentStore};
use tracing::info;

use crate::PrepError;

/// Parses one JSON object per line. Blank lines are skipped; line numbers in
/// errors start at 1.
pub fn parse_jsonl<R: BufRead>(reader: R) -> Result<Vec<Document>, PrepError> {
    let mut docs = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line).map_err(|e| PrepError::Import {
            line: index + 1,
            message: e.to_string(),
        })?;
        match value {
            Value::Object(doc) => docs.push(doc),
            other => {
                return Err(PrepError::Import {
                    line: index + 1,
                    message: format!("expected a JSON object, found {}", kind(&other)),
                });
            }
        }
    }
    Ok(docs)
}

/// Appends every document in `reader` to `collection`. Nothing is written
/// unless the whole input parses.
pub fn import_jsonl<R: BufRead>(
    store: &dyn DocumentStore,
    collection: &str,
    reader: R,
) -> Result<usize, PrepError> {
    let docs = parse_jsonl(reader)?;
    let rows = docs.len();
    store.insert_many(collection, docs)?;
    info!(collection, rows, "import_success");
    Ok(rows)
}

/// Writes every document of `collection` as one JSON line.
pub fn export_jsonl<W: Write>(
    store: &dyn DocumentStore,
    collection: &str,
    mut writer: W,
) -> Result<usize, PrepError> {
    let mut rows = 0;
    store.scan(collection, &mut |doc| {
        let mut line = serde_json::to_vec(&doc)?;
        line.push(b'\n');
        writer.write_all(&line)?;
        rows += 1;
        Ok(())
    })?;
    writer.flush()?;
    info!(collection, rows, "export_success");
    Ok(rows)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use store::{InMemoryStore, StoreError};

    #[test]
    fn import_skips_blank_lines() {
        let input = "{\"title\": \"A\"}\n\n{\"title\": \"B\"}\n";
        let store = InMemoryStore::new();
        let rows = import_jsonl(&store, "movies", input.as_bytes()).unwrap();
        assert_eq!(rows, 2);
        assert_eq!(store.count("movies").unwrap(), 2);
    }

    #[test]
    fn import_reports_line_of_bad_input() {
        let input = "{\"title\": \"A\"}\n[1, 2]\n";
        let store = InMemoryStore::new();
        let err = import_jsonl(&store, "movies", input.as_bytes()).unwrap_err();
        assert!(matches!(err, PrepError::Import { line: 2, .. }));
        assert_eq!(store.count("movies").unwrap(), 0);
    }

    #[test]
    fn export_writes_one_line_per_document() {
        let store = InMemoryStore::new();
        store
            .insert_many(
                "movies",
                vec![
                    store::document(json!({ "_id": 1, "title": "A" })),
                    store::document(json!({ "_id": 2, "title": "B" })),
                ],
            )
            .unwrap();

        let mut out = Vec::new();
        let rows = export_jsonl(&store, "movies", &mut out).unwrap();
        assert_eq!(rows, 2);

        let reparsed = parse_jsonl(out.as_slice()).unwrap();
        assert_eq!(reparsed.len(), 2);
        assert_eq!(reparsed[0]["title"], json!("A"));
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn export_surfaces_writer_failure() {
        let store = InMemoryStore::new();
        store
            .insert_many("movies", vec![store::document(json!({ "_id": 1 }))])
            .unwrap();

        let err = export_jsonl(&store, "movies", FullDisk).unwrap_err();
        assert!(matches!(err, PrepError::Store(StoreError::Io(_))), "{err}");
    }
}
