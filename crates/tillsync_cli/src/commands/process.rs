//! Process command implementation.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tillsync_engine::{EngineConfig, MemoryRepository, SyncEngine};
use tillsync_protocol::{Operation, SyncResult, UploadRequest};

/// Records to store before processing: entity type, then entity id, then payload.
pub type Seed = BTreeMap<String, BTreeMap<String, Value>>;

/// Builds an in-memory engine and processes one upload synchronously.
///
/// Seeded entity types are registered even when missing from `entities`.
pub fn process(
    upload: UploadRequest,
    config: EngineConfig,
    seed: &Seed,
    entities: &[String],
) -> Result<SyncResult, Box<dyn std::error::Error>> {
    let mut builder = SyncEngine::builder().with_config(config);
    let mut registered: Vec<&str> = entities.iter().map(String::as_str).collect();
    registered.extend(seed.keys().map(String::as_str));
    registered.sort_unstable();
    registered.dedup();
    for entity in registered {
        builder = builder.register(entity, Arc::new(MemoryRepository::new(entity)));
    }
    let engine = builder.build();

    for (entity, records) in seed {
        for (entity_id, data) in records {
            engine.applier().apply_direct(
                entity,
                Operation::Create,
                Some(entity_id),
                data.clone(),
                upload.branch_id.as_deref(),
            )?;
        }
    }

    Ok(engine.upload_blocking(upload)?)
}

/// Runs the process command.
pub fn run(
    upload_path: &Path,
    config_path: Option<&Path>,
    seed_path: Option<&Path>,
    entities: &[String],
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let upload: UploadRequest = serde_json::from_str(&std::fs::read_to_string(upload_path)?)?;
    let config: EngineConfig = match config_path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => EngineConfig::default(),
    };
    let seed: Seed = match seed_path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Seed::new(),
    };

    let result = process(upload, config, &seed, entities)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_summary(&result),
    }
    Ok(())
}

fn print_summary(result: &SyncResult) {
    println!("Batch {} ({})", result.batch_id, result.device_id);
    println!("  Status:     {}", result.status);
    println!("  Total:      {}", result.total_records);
    println!("  Processed:  {}", result.processed_records);
    println!("  Failed:     {}", result.failed_records);
    println!("  Conflicted: {}", result.conflicted_records);
    println!("  Took:       {} ms", result.processing_ms);

    for error in &result.errors {
        println!("  ✗ {} {:?}: {}", error.change_id, error.kind, error.message);
    }
    for conflict in &result.conflicts {
        println!(
            "  ! {} {}:{} {:?} on {:?}",
            conflict.id,
            conflict.entity,
            conflict.entity_id.as_deref().unwrap_or("-"),
            conflict.conflict_type,
            conflict.differing_fields
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tillsync_protocol::{BatchStatus, ConflictType, SyncChange};

    fn entities() -> Vec<String> {
        vec!["Product".to_string()]
    }

    #[test]
    fn processes_against_empty_store() {
        let upload = UploadRequest::new(
            "till-1",
            vec![SyncChange::create("Product", Some("p1".into()), json!({"name": "Tea"}), 1)],
        );
        let result = process(upload, EngineConfig::default(), &Seed::new(), &entities()).unwrap();
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.applied.len(), 1);
    }

    #[test]
    fn seeded_records_raise_conflicts() {
        let seed: Seed = serde_json::from_value(json!({
            "Product": {"p1": {"name": "Tea", "price": 300}}
        }))
        .unwrap();
        let upload = UploadRequest::new(
            "till-1",
            vec![SyncChange::update("Product", "p1", json!({"price": 400}), 0)],
        );

        let result = process(upload, EngineConfig::default(), &seed, &entities()).unwrap();
        assert_eq!(result.status, BatchStatus::Conflicted);
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::Version);
    }

    #[test]
    fn unregistered_types_fail_per_record() {
        let upload = UploadRequest::new(
            "till-1",
            vec![SyncChange::create("Ghost", Some("g1".into()), json!({"name": "x"}), 1)],
        );
        let result = process(upload, EngineConfig::default(), &Seed::new(), &entities()).unwrap();
        assert_eq!(result.status, BatchStatus::Failed);
        assert_eq!(result.failed_records, 1);
    }
}
