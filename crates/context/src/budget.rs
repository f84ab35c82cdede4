//! Token budget allocation.
//!
//! Splits an overall token ceiling between the three context parts by
//! weight, clamps each share into its `[min, max]` bounds, and hands any
//! surplus or shortfall created by clamping to the categories that still
//! have room, for a bounded number of passes.
//!
//! Allocation is pure and total: every `max_tokens` gets an answer and the
//! answer never sums above `max_tokens`.

use planctx_config::{BudgetConfig, CategoryConfig};
use serde::{Deserialize, Serialize};

const MESSAGES: usize = 0;
const MEMORY: usize = 1;
const PLAN: usize = 2;

/// Tokens granted to each context part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub messages: usize,
    pub memory: usize,
    pub plan: usize,
}

impl BudgetAllocation {
    pub fn total(&self) -> usize {
        self.messages + self.memory + self.plan
    }
}

/// Weighted, bounded allocator over the messages/memory/plan categories.
#[derive(Debug, Clone)]
pub struct TokenBudgetAllocator {
    categories: [CategoryConfig; 3],
    max_passes: usize,
}

impl Default for TokenBudgetAllocator {
    fn default() -> Self {
        Self::new(&BudgetConfig::default())
    }
}

impl TokenBudgetAllocator {
    /// A category whose `max` sits below its `min` is pinned at `min`.
    pub fn new(config: &BudgetConfig) -> Self {
        let bounded = |c: CategoryConfig| CategoryConfig {
            max: c.max.max(c.min),
            ..c
        };
        Self {
            categories: [bounded(config.messages), bounded(config.memory), bounded(config.plan)],
            max_passes: config.max_passes,
        }
    }

    pub fn allocate(&self, max_tokens: usize) -> BudgetAllocation {
        let floors: usize = self.categories.iter().map(|c| c.min).sum();
        if max_tokens < floors {
            return self.scaled_floors(max_tokens, floors);
        }

        let total_weight: f64 = self.categories.iter().map(|c| c.weight).sum();
        let mut shares = [0usize; 3];
        for (i, category) in self.categories.iter().enumerate() {
            let fraction = if total_weight > 0.0 {
                category.weight / total_weight
            } else {
                1.0 / 3.0
            };
            let raw = (fraction * max_tokens as f64 + 1e-9).floor() as usize;
            shares[i] = raw.clamp(category.min, category.max);
        }

        for _ in 0..self.max_passes {
            let sum: usize = shares.iter().sum();
            if sum == max_tokens {
                break;
            }

            if sum < max_tokens {
                let room: Vec<usize> = (0..3)
                    .filter(|&i| shares[i] < self.categories[i].max)
                    .collect();
                if room.is_empty() {
                    break;
                }
                for (i, extra) in self.split(max_tokens - sum, &room) {
                    shares[i] = (shares[i] + extra).min(self.categories[i].max);
                }
            } else {
                let slack: Vec<usize> = (0..3)
                    .filter(|&i| shares[i] > self.categories[i].min)
                    .collect();
                if slack.is_empty() {
                    break;
                }
                for (i, cut) in self.split(sum - max_tokens, &slack) {
                    shares[i] = shares[i].saturating_sub(cut).max(self.categories[i].min);
                }
            }
        }

        // Passes ran out while still over: take the rest from the lightest categories.
        let mut excess = shares.iter().sum::<usize>().saturating_sub(max_tokens);
        for i in self.by_weight_ascending() {
            if excess == 0 {
                break;
            }
            let cut = excess.min(shares[i].saturating_sub(self.categories[i].min));
            shares[i] -= cut;
            excess -= cut;
        }

        BudgetAllocation {
            messages: shares[MESSAGES],
            memory: shares[MEMORY],
            plan: shares[PLAN],
        }
    }

    /// `max_tokens` cannot cover the floors: shrink them proportionally.
    fn scaled_floors(&self, max_tokens: usize, floors: usize) -> BudgetAllocation {
        let scale = |i: usize| self.categories[i].min * max_tokens / floors.max(1);
        BudgetAllocation {
            messages: scale(MESSAGES),
            memory: scale(MEMORY),
            plan: scale(PLAN),
        }
    }

    /// Split `amount` over `members` in proportion to their weights.
    /// Leftover units go one each to the heaviest members first.
    fn split(&self, amount: usize, members: &[usize]) -> Vec<(usize, usize)> {
        let weight = |i: usize| self.categories[i].weight.max(0.0);
        let total: f64 = members.iter().map(|&i| weight(i)).sum();

        let mut parts: Vec<(usize, usize)> = members
            .iter()
            .map(|&i| {
                let fraction = if total > 0.0 {
                    weight(i) / total
                } else {
                    1.0 / members.len() as f64
                };
                (i, (amount as f64 * fraction + 1e-9).floor() as usize)
            })
            .collect();

        let handed_out: usize = parts.iter().map(|(_, n)| n).sum();
        let mut leftover = amount.saturating_sub(handed_out);

        let mut order: Vec<usize> = (0..parts.len()).collect();
        order.sort_by(|&a, &b| {
            weight(parts[b].0)
                .total_cmp(&weight(parts[a].0))
                .then(parts[a].0.cmp(&parts[b].0))
        });
        for slot in order.into_iter().cycle() {
            if leftover == 0 {
                break;
            }
            parts[slot].1 += 1;
            leftover -= 1;
        }
        parts
    }

    fn by_weight_ascending(&self) -> Vec<usize> {
        let mut order = vec![MESSAGES, MEMORY, PLAN];
        order.sort_by(|&a, &b| {
            self.categories[a]
                .weight
                .total_cmp(&self.categories[b].weight)
                .then(b.cmp(&a))
        });
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> TokenBudgetAllocator {
        TokenBudgetAllocator::default()
    }

    #[test]
    fn default_split_at_8000() {
        let allocation = allocator().allocate(8000);
        assert_eq!(
            allocation,
            BudgetAllocation {
                messages: 4000,
                memory: 2800,
                plan: 1200
            }
        );
    }

    #[test]
    fn surplus_flows_to_categories_with_room() {
        // Raw 4500/3150/1350 clamps messages and memory; plan takes the rest.
        let allocation = allocator().allocate(9000);
        assert_eq!(
            allocation,
            BudgetAllocation {
                messages: 4000,
                memory: 3000,
                plan: 2000
            }
        );
    }

    #[test]
    fn all_ceilings_hit_leaves_budget_unused() {
        let allocation = allocator().allocate(50_000);
        assert_eq!(allocation.total(), 9000);
    }

    #[test]
    fn floors_push_back_on_small_budgets() {
        // Raw 150/105/45 lifts plan to its floor of 50; the 5 extra come
        // back out of messages and memory.
        let allocation = allocator().allocate(300);
        assert_eq!(allocation.total(), 300);
        assert_eq!(allocation.plan, 50);
        assert!(allocation.messages >= 100);
        assert!(allocation.memory >= 50);
    }

    #[test]
    fn degenerate_budget_scales_floors() {
        let allocation = allocator().allocate(100);
        assert_eq!(
            allocation,
            BudgetAllocation {
                messages: 50,
                memory: 25,
                plan: 25
            }
        );
        assert_eq!(allocator().allocate(0).total(), 0);
    }

    #[test]
    fn never_exceeds_max_and_respects_bounds() {
        let allocator = allocator();
        for max in (0..20_000).step_by(37) {
            let allocation = allocator.allocate(max);
            assert!(allocation.total() <= max, "over budget at {max}: {allocation:?}");
            if max >= 200 {
                assert!((100..=4000).contains(&allocation.messages), "{max}: {allocation:?}");
                assert!((50..=3000).contains(&allocation.memory), "{max}: {allocation:?}");
                assert!((50..=2000).contains(&allocation.plan), "{max}: {allocation:?}");
            }
        }
    }

    #[test]
    fn deterministic() {
        let allocator = allocator();
        assert_eq!(allocator.allocate(6123), allocator.allocate(6123));
    }

    #[test]
    fn inverted_bounds_pin_category_at_floor() {
        let config = BudgetConfig {
            messages: CategoryConfig { weight: 0.5, min: 500, max: 100 },
            ..BudgetConfig::default()
        };
        let allocator = TokenBudgetAllocator::new(&config);

        let allocation = allocator.allocate(700);
        assert_eq!(allocation.total(), 700);
        assert_eq!(allocation.messages, 500);

        for max in (0..12_000).step_by(41) {
            let allocation = allocator.allocate(max);
            assert!(allocation.total() <= max, "over budget at {max}: {allocation:?}");
            if max >= 600 {
                assert_eq!(allocation.messages, 500, "{max}: {allocation:?}");
            }
        }
    }

    #[test]
    fn custom_weights_redistribute_evenly() {
        let config = BudgetConfig {
            messages: CategoryConfig { weight: 0.8, min: 100, max: 1000 },
            memory: CategoryConfig { weight: 0.1, min: 50, max: 3000 },
            plan: CategoryConfig { weight: 0.1, min: 50, max: 2000 },
            max_passes: 4,
        };
        let allocation = TokenBudgetAllocator::new(&config).allocate(4000);
        assert_eq!(
            allocation,
            BudgetAllocation {
                messages: 1000,
                memory: 1500,
                plan: 1500
            }
        );
    }
}
