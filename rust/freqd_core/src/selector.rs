// SPDX-License-Identifier: GPL-2.0
//
// freqd: core selector parsing.
//
// Selectors use the kernel's cpu-list syntax ("3", "0-2,5") plus the "all"
// keyword. The same parser also handles the `present`/`online` mask files
// under /sys/devices/system/cpu, which use the identical syntax.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Upper bound on explicit cores in one selector. Far above any real
/// machine; guards against hostile input through the IPC path.
const MAX_SELECTOR_CORES: usize = 4096;

/// Refers to one core, a set of cores, or every present core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CoreSelector {
    All,
    Cores(Vec<u32>),
}

impl CoreSelector {
    pub fn parse(expr: &str) -> Result<Self, String> {
        if expr.trim() == "all" {
            return Ok(CoreSelector::All);
        }
        parse_core_list(expr).map(CoreSelector::Cores)
    }

    /// Concrete core ids this selector names, restricted to the cores that
    /// are actually present. Order follows the selector; `All` follows the
    /// topology.
    pub fn resolve(&self, present: &[u32]) -> Vec<u32> {
        match self {
            CoreSelector::All => present.to_vec(),
            CoreSelector::Cores(cores) => cores
                .iter()
                .copied()
                .filter(|c| present.contains(c))
                .collect(),
        }
    }
}

impl std::fmt::Display for CoreSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreSelector::All => write!(f, "all"),
            CoreSelector::Cores(cores) => {
                let mut first = true;
                for (start, end) in compact_ranges(cores) {
                    if !first {
                        write!(f, ",")?;
                    }
                    first = false;
                    if start == end {
                        write!(f, "{start}")?;
                    } else {
                        write!(f, "{start}-{end}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl TryFrom<String> for CoreSelector {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        CoreSelector::parse(&s)
    }
}

impl From<CoreSelector> for String {
    fn from(sel: CoreSelector) -> String {
        sel.to_string()
    }
}

/// Parse a comma-separated list of cores and ranges ("0-3,12-15,7").
/// Duplicates are dropped, first occurrence wins.
pub fn parse_core_list(expr: &str) -> Result<Vec<u32>, String> {
    if expr
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        return Err(format!("invalid character in core list `{expr}`"));
    }

    let mut cores = Vec::new();
    let mut seen = HashSet::new();

    for token in expr.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if let Some((start_str, end_str)) = token.split_once('-') {
            let start = start_str
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid range start in `{token}`"))?;
            let end = end_str
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid range end in `{token}`"))?;
            if start > end {
                return Err(format!("invalid core range: {start}-{end}"));
            }
            for i in start..=end {
                if cores.len() >= MAX_SELECTOR_CORES {
                    return Err(format!("too many cores in selector (max {MAX_SELECTOR_CORES})"));
                }
                if seen.insert(i) {
                    cores.push(i);
                }
            }
        } else {
            let core = token
                .parse::<u32>()
                .map_err(|_| format!("invalid core id: `{token}`"))?;
            if cores.len() >= MAX_SELECTOR_CORES {
                return Err(format!("too many cores in selector (max {MAX_SELECTOR_CORES})"));
            }
            if seen.insert(core) {
                cores.push(core);
            }
        }
    }

    if cores.is_empty() {
        return Err(format!("empty core list `{expr}`"));
    }

    Ok(cores)
}

/// Collapse a core list into inclusive (start, end) runs over its sorted
/// form, for canonical display.
fn compact_ranges(cores: &[u32]) -> Vec<(u32, u32)> {
    let mut sorted: Vec<u32> = cores.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs = Vec::new();
    for core in sorted {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == core => *end = core,
            _ => runs.push((core, core)),
        }
    }
    runs
}
