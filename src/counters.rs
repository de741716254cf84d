use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

static AUTONAME_COUNTERS: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();

fn counter_map() -> &'static Mutex<HashMap<String, u64>> {
    AUTONAME_COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Next unique name under `prefix`, e.g. `::treenx::__#3`.
pub fn next_autoname(prefix: &str) -> String {
    let mut map = counter_map().lock().unwrap_or_else(|e| e.into_inner());
    let counter = map.entry(prefix.to_string()).or_insert(0);
    let name = format!("::{}::__#{}", prefix, counter);
    *counter = counter.saturating_add(1);
    name
}

#[cfg(test)]
fn snapshot_autonames() -> Vec<(String, u64)> {
    let map = counter_map().lock().unwrap_or_else(|e| e.into_inner());
    map.iter().map(|(k, v)| (k.clone(), *v)).collect()
}
