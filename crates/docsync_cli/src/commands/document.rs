//! Local document commands.

use docsync_core::{
    body_from_value, split_id, Filter, IndexDefinition, IndexManager, LocalStore, StoreConfig,
};
use std::path::Path;
use std::sync::Arc;

fn open(path: &Path) -> Result<LocalStore, Box<dyn std::error::Error>> {
    Ok(LocalStore::open(path, StoreConfig::default())?)
}

/// Runs the put command.
pub fn put(path: &Path, json: &str) -> Result<(), Box<dyn std::error::Error>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let (id, body) = split_id(body_from_value(value)?)?;

    let store = open(path)?;
    let revision = store.put(&id, body)?;
    println!("{id} {revision}");
    Ok(())
}

/// Runs the get command.
pub fn get(path: &Path, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open(path)?;
    let document = store.get(&docsync_core::DocumentId::new(id)?)?;
    println!("{}", serde_json::to_string_pretty(&document.to_json())?);
    Ok(())
}

/// Runs the list command.
pub fn list(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = open(path)?;
    for document in store.all() {
        println!("{} {}", document.id, document.revision);
    }
    println!("{} document(s), last sequence {}", store.len(), store.last_sequence());
    Ok(())
}

/// Runs the query command.
pub fn query(
    path: &Path,
    filter: &str,
    indexes: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = Filter::from_json(&serde_json::from_str(filter)?)?;

    let store = Arc::new(open(path)?);
    let manager = IndexManager::new(Arc::clone(&store));
    manager.ensure_index(IndexDefinition::default_index())?;
    for spec in indexes {
        manager.ensure_index(parse_index(spec)?)?;
    }
    manager.update_all_indexes()?;

    let hits = manager.query(&filter)?;
    for document in &hits {
        println!("{}", serde_json::to_string(&document.to_json())?);
    }
    eprintln!("{} match(es)", hits.len());
    Ok(())
}

/// Runs the compact command.
pub fn compact(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = open(path)?;
    println!("Compacting store at {:?}", path);

    let stats = store.compact()?;
    println!("  Documents:   {}", stats.documents);
    println!("  Size before: {} bytes", stats.bytes_before);
    println!("  Size after:  {} bytes", stats.bytes_after);
    println!(
        "  Space saved: {} bytes",
        stats.bytes_before.saturating_sub(stats.bytes_after)
    );
    Ok(())
}

/// Parses `NAME=field[,field...]`.
fn parse_index(spec: &str) -> Result<IndexDefinition, String> {
    let (name, fields) = spec
        .split_once('=')
        .ok_or_else(|| format!("index {spec:?} must look like NAME=field[,field...]"))?;
    let definition = IndexDefinition::new(name.trim(), fields.split(',').map(str::trim));
    definition
        .validate()
        .map_err(|e| format!("index {spec:?}: {e}"))?;
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_index_specs() {
        let definition = parse_index("by_name=name").unwrap();
        assert_eq!(definition.name, "by_name");
        assert_eq!(definition.fields, ["name"]);

        let definition = parse_index("by_place = city, country").unwrap();
        assert_eq!(definition.fields, ["city", "country"]);

        assert!(parse_index("by_name").is_err());
        assert!(parse_index("=name").is_err());
        assert!(parse_index("dup=a,a").is_err());
    }

    #[test]
    fn put_then_query() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");

        put(&path, r#"{"_id": "ada", "name": "Ada"}"#).unwrap();
        put(&path, r#"{"_id": "bob", "name": "Bob"}"#).unwrap();
        query(&path, r#"{"name": "Bob"}"#, &["by_name=name".to_string()]).unwrap();
        compact(&path).unwrap();

        let store = open(&path).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn rejects_non_object_bodies() {
        let temp = tempdir().unwrap();
        assert!(put(temp.path(), "[1, 2]").is_err());
        assert!(put(temp.path(), "not json").is_err());
    }
}
