//! Single-threaded recursive reference for the reverse scan count.

use crate::pointer_scan::types::{PointerBucket, ReverseScanConfig};

pub fn reference_count(buckets: &[PointerBucket], target: i64, config: &ReverseScanConfig) -> u64 {
    let mut sorted: Vec<&PointerBucket> = buckets.iter().collect();
    // 降序：与 worker 的窗口遍历顺序一致
    sorted.sort_by_key(|b| std::cmp::Reverse(b.key()));

    let mut path = Vec::new();
    visit(&sorted, config, target, 0, &mut path)
}

fn visit(sorted: &[&PointerBucket], config: &ReverseScanConfig, value: i64, level: u32, path: &mut Vec<i64>) -> u64 {
    if level >= config.max_level {
        return 0;
    }
    if config.no_loop {
        if path.contains(&value) {
            return 0;
        }
        path.push(value);
    }

    let start = value.saturating_sub(config.struct_size as i64).max(0);
    let mut hits = 0;
    let mut buckets_visited = 0;

    for bucket in sorted.iter().filter(|b| b.key() >= start && b.key() <= value) {
        for record in bucket.records() {
            if record.is_static() {
                hits += 1;
            } else if level + 1 < config.max_level {
                hits += visit(sorted, config, record.address, level + 1, path);
            }
        }

        if let Some(limit) = config.max_offsets_per_node
            && level > 0
        {
            buckets_visited += 1;
            if buckets_visited >= limit {
                break;
            }
        }
    }

    if config.no_loop {
        path.pop();
    }
    hits
}
