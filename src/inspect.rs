//! Script inspection: derive the core count a script will occupy.
//!
//! Two sources feed the estimate: `-np`/`-n` arguments inside the script
//! itself, and a `system/decomposeParDict` file in the case directory tree.
//! The larger of the two wins; the floor is always 1.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// `-np 8`, `-np=8`, `-n 4`, `-n=4`, `-np8`.
static CORES_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-np?\s*=?\s*(\d+)").unwrap());

/// `numberOfSubdomains 12;` with arbitrary interior whitespace.
static SUBDOMAINS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"numberOfSubdomains\s+(\d+)\s*;").unwrap());

/// How far above the script's directory to look for `system/decomposeParDict`.
const DICT_SEARCH_DEPTH: usize = 5;

/// Cores the script at `path` is expected to occupy. Returns 1 on any read
/// failure or when nothing in the script or its case tree declares a count.
pub fn required_cores(path: &Path) -> u32 {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return 1;
    };

    let mut derived = contents
        .lines()
        .filter(|line| !is_comment(line))
        .filter_map(max_cores_in_line)
        .max()
        .unwrap_or(1);

    if let Some(dir) = path.parent()
        && let Some(subdomains) = decompose_par_dict_count(dir)
        && subdomains > derived
    {
        derived = subdomains;
    }

    derived.max(1)
}

/// Batch comment syntax: `REM` (any case) or `::` opening the line.
fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("::")
        || trimmed
            .split_whitespace()
            .next()
            .is_some_and(|tok| tok.to_ascii_lowercase().starts_with("rem"))
}

fn max_cores_in_line(line: &str) -> Option<u32> {
    CORES_ARG
        .captures_iter(line)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .max()
}

/// Walk up from the script directory looking for `system/decomposeParDict`
/// and extract its `numberOfSubdomains` entry.
fn decompose_par_dict_count(start: &Path) -> Option<u32> {
    let mut dir = Some(start);
    for _ in 0..=DICT_SEARCH_DEPTH {
        let current = dir?;
        let dict = current.join("system").join("decomposeParDict");
        if dict.is_file()
            && let Ok(contents) = std::fs::read_to_string(&dict)
            && let Some(caps) = SUBDOMAINS.captures(&contents)
            && let Ok(n) = caps[1].parse::<u32>()
        {
            return Some(n);
        }
        dir = current.parent();
    }
    None
}
