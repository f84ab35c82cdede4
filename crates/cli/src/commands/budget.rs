//! `planctx budget`: Show the token split for a context ceiling.

use planctx_context::TokenBudgetAllocator;

use super::{CliResult, load_config};

pub async fn run(max_tokens: Option<usize>) -> CliResult {
    let config = load_config()?;
    let max_tokens = max_tokens.unwrap_or(config.context.max_tokens);
    let allocation = TokenBudgetAllocator::new(&config.budget).allocate(max_tokens);

    let rows = [
        ("messages", allocation.messages, &config.budget.messages),
        ("memory", allocation.memory, &config.budget.memory),
        ("plan", allocation.plan, &config.budget.plan),
    ];

    println!("📊 Token budget for {max_tokens} tokens");
    println!("================================");
    for (name, tokens, category) in rows {
        println!(
            "  {name:<9} {tokens:>6}   (weight {:.2}, bounds {}..={})",
            category.weight, category.min, category.max
        );
    }
    println!("  {:<9} {:>6}", "total", allocation.total());

    let unused = max_tokens.saturating_sub(allocation.total());
    if unused > 0 {
        println!("\n  ⚠️  {unused} tokens left unallocated");
    }

    Ok(())
}
