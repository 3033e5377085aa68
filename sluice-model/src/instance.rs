use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const UID_FILE: &str = ".uid";

const ROMAN_NUMERALS: [&str; 31] = [
    "", "I", "II", "III", "IV", "V", "VI", "VII", "VIII", "IX", "X", "XI", "XII", "XIII",
    "XIV", "XV", "XVI", "XVII", "XVIII", "XIX", "XX", "XXI", "XXII", "XXIII", "XXIV", "XXV",
    "XXVI", "XXVII", "XXVIII", "XXIX", "XXX",
];

/// Process identity: a stable UID persisted next to the working directory
/// and a human-friendly name drawn from the `uid-masks` dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub uid: String,
    pub name: String,
    pub started: DateTime<Utc>,
}

impl Instance {
    pub fn bootstrap(workdir: &Path, config_selector: &str, taken_names: &[String]) -> Instance {
        let uid = load_or_create_uid(workdir, config_selector);
        let masks = load_uid_masks(workdir);
        let name = match masks {
            Some(names) if !names.is_empty() => pick_name(&names, taken_names),
            _ => {
                warn!("uid-masks dictionary missing; instance name falls back to uid {uid}");
                uid.clone()
            }
        };
        Instance {
            uid,
            name,
            started: Utc::now(),
        }
    }
}

fn workdir_root() -> PathBuf {
    std::env::var("WORKDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load the 32-hex instance UID from `WORKDIR/.uid`, generating and
/// persisting one on first launch.
pub fn load_or_create_uid(workdir: &Path, config_selector: &str) -> String {
    let path = workdir.join(UID_FILE);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            debug!("loaded instance uid from {}", path.display());
            return existing.to_string();
        }
    }

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let argv: Vec<String> = std::env::args().collect();
    let source = format!("{hostname}|{}|{config_selector}", argv.join(" "));
    let uid = format!("{:x}", Md5::digest(source.as_bytes()));

    if let Err(e) = std::fs::write(&path, &uid) {
        warn!("failed to persist instance uid to {}: {e}", path.display());
    } else {
        info!("generated instance uid {uid}");
    }
    uid
}

fn load_uid_masks(workdir: &Path) -> Option<Vec<String>> {
    let file = std::env::var("UID_MASKS_FILE").unwrap_or_else(|_| "uid-masks".to_string());
    let candidates = [PathBuf::from(&file), workdir.join(&file)];
    for path in &candidates {
        if let Ok(content) = std::fs::read_to_string(path) {
            let names: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            debug!("loaded {} names from {}", names.len(), path.display());
            return Some(names);
        }
    }
    None
}

fn pick_name(masks: &[String], taken: &[String]) -> String {
    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let base = masks
            .choose(&mut rng)
            .expect("masks checked non-empty")
            .clone();
        let candidate = next_free_suffix(taken, &base);
        if !taken.contains(&candidate) {
            return candidate;
        }
    }
    format!("Instance-{}", Utc::now().timestamp())
}

/// First free `base`, `base-I`, `base-II`, ... among already-registered
/// instance names.
pub fn next_free_suffix(taken: &[String], base: &str) -> String {
    if !taken.iter().any(|n| n == base) {
        return base.to_string();
    }
    let mut used = vec![0usize];
    let prefix = format!("{base}-");
    for name in taken {
        if let Some(suffix) = name.strip_prefix(&prefix) {
            if let Some(idx) = ROMAN_NUMERALS.iter().position(|r| *r == suffix) {
                used.push(idx);
            }
        }
    }
    let next = used.iter().max().copied().unwrap_or(0) + 1;
    match ROMAN_NUMERALS.get(next) {
        Some(suffix) => format!("{base}-{suffix}"),
        None => format!("{base}-{next}"),
    }
}

/// Convenience wrapper honoring the WORKDIR environment anchor.
pub fn default_workdir() -> PathBuf {
    workdir_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_of_a_base_name_has_no_suffix() {
        assert_eq!(next_free_suffix(&[], "Lovelace"), "Lovelace");
    }

    #[test]
    fn collisions_get_roman_suffixes_in_order() {
        let taken = vec!["Lovelace".to_string()];
        assert_eq!(next_free_suffix(&taken, "Lovelace"), "Lovelace-I");

        let taken = vec![
            "Lovelace".to_string(),
            "Lovelace-I".to_string(),
            "Lovelace-II".to_string(),
        ];
        assert_eq!(next_free_suffix(&taken, "Lovelace"), "Lovelace-III");
    }

    #[test]
    fn suffixes_past_the_table_fall_back_to_digits() {
        let mut taken = vec!["Node".to_string()];
        taken.extend(
            ROMAN_NUMERALS
                .iter()
                .skip(1)
                .map(|r| format!("Node-{r}")),
        );
        assert_eq!(next_free_suffix(&taken, "Node"), "Node-31");
    }

    #[test]
    fn uid_file_round_trips() {
        let dir = std::env::temp_dir().join(format!("sluice-uid-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let first = load_or_create_uid(&dir, "configs/test.toml");
        let second = load_or_create_uid(&dir, "configs/other.toml");
        assert_eq!(first, second, "uid must be stable once persisted");
        assert_eq!(first.len(), 32);
        std::fs::remove_dir_all(&dir).ok();
    }
}
