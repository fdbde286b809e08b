use crate::models::{ExperimentVariant, FlagVariant};

/// Anything that takes part in weighted selection.
pub trait Weighted {
    fn weight(&self) -> u32;
}

impl Weighted for ExperimentVariant {
    fn weight(&self) -> u32 {
        self.weight
    }
}

impl Weighted for FlagVariant {
    fn weight(&self) -> u32 {
        self.weight
    }
}

/// Sum of all weights.
pub fn total_weight<T: Weighted>(items: &[T]) -> u64 {
    items.iter().map(|item| u64::from(item.weight())).sum()
}

/// Pick an item by cumulative weight.
///
/// `hash` is reduced modulo the total weight; items are walked in order and the first one whose
/// cumulative weight exceeds the bucket wins. Returns `None` when the total weight is zero.
pub fn select_by_hash<T: Weighted>(items: &[T], hash: u64) -> Option<&T> {
    let total = total_weight(items);
    if total == 0 {
        return None;
    }

    let bucket = hash % total;
    let mut cumulative = 0u64;
    items.iter().find(|item| {
        cumulative += u64::from(item.weight());
        bucket < cumulative
    })
}
