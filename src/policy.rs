//! Input policy for viewer-originated keystrokes.

use std::sync::LazyLock;

use regex::Regex;

struct DangerPattern {
    rule: &'static str,
    regex: &'static LazyLock<Regex>,
}

static RM_RECURSIVE_FORCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\brm\s+(?:-[a-z]*r[a-z]*f[a-z]*|-[a-z]*f[a-z]*r[a-z]*|-r\s+-f|-f\s+-r)\b")
        .expect("rm -rf regex")
});
static MKFS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bmkfs(?:\.\w+)?\b").expect("mkfs regex"));
static DD_TO_DEVICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bdd\b[^\n]*\bof=/dev/").expect("dd regex"));
static REDIRECT_TO_DISK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">\s*/dev/(?:sd|nvme|disk|hd)").expect("disk redirect regex"));
static FORK_BOMB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:").expect("fork bomb regex"));
static POWER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)(?:^|[;&|]\s*|sudo\s+)(?:shutdown|reboot|halt|poweroff)\b").expect("power regex"));
static GIT_FORCE_PUSH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bgit\s+push\b[^\n]*(?:--force\b|--force-with-lease\b|\s-f\b)").expect("git push regex")
});
static GIT_RESET_HARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bgit\s+(?:reset\s+--hard|clean\s+-[a-z]*f)").expect("git reset regex"));
static CHMOD_ROOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bchmod\s+-R\s+0?777\s+/(?:\s|$)").expect("chmod regex"));

static DANGER_PATTERNS: &[DangerPattern] = &[
    DangerPattern { rule: "rm_recursive_force", regex: &RM_RECURSIVE_FORCE },
    DangerPattern { rule: "mkfs", regex: &MKFS },
    DangerPattern { rule: "dd_to_device", regex: &DD_TO_DEVICE },
    DangerPattern { rule: "redirect_to_disk", regex: &REDIRECT_TO_DISK },
    DangerPattern { rule: "fork_bomb", regex: &FORK_BOMB },
    DangerPattern { rule: "power", regex: &POWER },
    DangerPattern { rule: "git_force_push", regex: &GIT_FORCE_PUSH },
    DangerPattern { rule: "git_discard", regex: &GIT_RESET_HARD },
    DangerPattern { rule: "chmod_root", regex: &CHMOD_ROOT },
];

/// Name of the first destructive-command rule `text` trips, if any.
pub fn dangerous_rule(text: &str) -> Option<&'static str> {
    DANGER_PATTERNS
        .iter()
        .find(|p| p.regex.is_match(text))
        .map(|p| p.rule)
}

const NAMED_KEYS: &[&str] = &[
    "Enter", "Escape", "Tab", "BTab", "BSpace", "DC", "Space", "Up", "Down", "Left", "Right",
    "Home", "End", "PPage", "NPage", "PageUp", "PageDown", "IC",
];

/// Whether `key` is a tmux key name viewers may send.
pub fn is_allowed_key(key: &str) -> bool {
    if NAMED_KEYS.contains(&key) {
        return true;
    }
    if let Some(letter) = key.strip_prefix("C-") {
        return letter.len() == 1 && letter.bytes().all(|b| b.is_ascii_lowercase());
    }
    if let Some(n) = key.strip_prefix('F') {
        return n.parse::<u8>().is_ok_and(|n| (1..=12).contains(&n));
    }
    false
}
