//! `planctx memory`: Embedding store commands.

use planctx_core::memory::{EmbeddingRecord, NearestQuery};

use super::{CliResult, load_config, open_vector_store};

/// Parse a comma-separated vector such as `0.1, 0.2,0.3`.
pub fn parse_vector(raw: &str) -> Result<Vec<f32>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>()
                .map_err(|e| format!("invalid vector component '{s}': {e}"))
        })
        .collect()
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(80).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

fn print_record(record: &EmbeddingRecord) {
    println!("  ID:        {}", record.id);
    println!("  Plan:      {}", record.plan_id);
    match &record.ref_id {
        Some(ref_id) => println!("  Ref:       {}/{}", record.ref_type, ref_id),
        None => println!("  Ref:       {} (free-standing)", record.ref_type),
    }
    println!("  Version:   {}", record.version);
    if let (Some(at), Some(by)) = (&record.deletion.deleted_at, &record.deletion.deleted_by) {
        println!("  Deleted:   {} by {by}", at.to_rfc3339());
    }
    println!("  Content:   {}", preview(&record.content));
}

pub async fn stats(plan: Option<&str>) -> CliResult {
    let config = load_config()?;
    let store = open_vector_store(&config).await?;

    println!("🧠 Embedding Store");
    println!("==================");
    println!("  Backend:    {}", store.name());
    println!("  Dimension:  {}", config.store.dimension);
    if config.store.backend == "sqlite" {
        println!("  DB file:    {}", config.store_path().display());
    }
    if let Some(plan) = plan {
        let active = store.count_active(plan).await?;
        println!("  Active:     {active} records in plan {plan}");
    }

    Ok(())
}

pub async fn query(plan: &str, vector: &str, top_k: usize, threshold: f32) -> CliResult {
    let config = load_config()?;
    let store = open_vector_store(&config).await?;
    let vector = parse_vector(vector)?;

    println!("🔍 Nearest records in plan {plan} (top {top_k}, threshold {threshold:.2})");
    println!();

    let results = store
        .query_nearest(NearestQuery {
            plan_id: plan.to_string(),
            vector,
            top_k,
            threshold,
        })
        .await?;

    if results.is_empty() {
        println!("   No records above the threshold.");
    } else {
        for (i, scored) in results.iter().enumerate() {
            println!(
                "  {:>2}. [similarity: {:.3}] {} {}",
                i + 1,
                scored.similarity,
                scored.record.id,
                preview(&scored.record.content)
            );
        }
    }

    Ok(())
}

pub async fn delete(id: &str, by: &str) -> CliResult {
    let config = load_config()?;
    let store = open_vector_store(&config).await?;

    let record = store.soft_delete(id, by).await?;
    println!("🗑️  Soft-deleted embedding");
    print_record(&record);
    Ok(())
}

pub async fn restore(id: &str) -> CliResult {
    let config = load_config()?;
    let store = open_vector_store(&config).await?;

    let record = store.restore(id).await?;
    println!("♻️  Restored embedding");
    print_record(&record);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vector_with_spaces() {
        assert_eq!(parse_vector("0.5, -1,2e-1").unwrap(), vec![0.5, -1.0, 0.2]);
    }

    #[test]
    fn rejects_garbage_component() {
        let err = parse_vector("0.1,abc").unwrap_err();
        assert!(err.contains("abc"));
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "é".repeat(100);
        let shown = preview(&long);
        assert_eq!(shown.chars().count(), 81);
        assert_eq!(preview("short"), "short");
    }
}
