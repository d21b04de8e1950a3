//! Model grouping and per-credential cooldown bookkeeping.
//!
//! Models map to a `ModelGroup` through an explicit table keyed by canonical
//! model id; anything not listed lands in the configured fallback group.
//! Cooldown is tracked per credential per group as a last-use timestamp and
//! is a preference only: selection still hands out a cooling credential when
//! nothing else is eligible.

use std::collections::HashMap;

use crate::model::{Credential, ModelGroup};
use crate::settings::CooldownSettings;

/// Built-in model ids. Config entries extend or override these.
const DEFAULT_MODELS: &[(&str, ModelGroup)] = &[
    ("gemini-2.0-flash", ModelGroup::Flash),
    ("gemini-2.5-flash", ModelGroup::Flash),
    ("gemini-2.5-flash-lite", ModelGroup::Flash),
    ("gemini-2.5-flash-image", ModelGroup::Flash),
    ("gemini-2.5-pro", ModelGroup::Pro),
    ("gemini-3-pro-preview", ModelGroup::Tier3),
    ("gemini-3-flash-preview", ModelGroup::Tier3),
    ("gemini-3-pro-image-preview", ModelGroup::Tier3),
];

/// Canonical id → group lookup.
#[derive(Debug, Clone)]
pub struct ModelTable {
    entries: HashMap<String, ModelGroup>,
    fallback: ModelGroup,
}

impl Default for ModelTable {
    fn default() -> Self {
        Self::new(ModelGroup::Flash)
    }
}

impl ModelTable {
    /// Table seeded with the built-in ids.
    pub fn new(fallback: ModelGroup) -> Self {
        let entries = DEFAULT_MODELS
            .iter()
            .map(|(id, group)| (id.to_string(), *group))
            .collect();
        Self { entries, fallback }
    }

    /// Add or override entries; keys are canonicalized first.
    pub fn with_entries<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, ModelGroup)>,
        S: AsRef<str>,
    {
        for (id, group) in entries {
            self.entries.insert(canonical_model_id(id.as_ref()), group);
        }
        self
    }

    pub fn group_for(&self, model: &str) -> ModelGroup {
        self.entries
            .get(&canonical_model_id(model))
            .copied()
            .unwrap_or(self.fallback)
    }

    pub fn fallback(&self) -> ModelGroup {
        self.fallback
    }
}

/// Lowercase, trimmed, with any `models/` style path prefix removed.
pub fn canonical_model_id(model: &str) -> String {
    let trimmed = model.trim();
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.to_ascii_lowercase()
}

/// Whether `credential` is cooling down for `group` at `now`.
pub fn in_cooldown(
    credential: &Credential,
    group: ModelGroup,
    settings: &CooldownSettings,
    now: u64,
) -> bool {
    remaining_ms(credential, group, settings, now) > 0
}

/// Milliseconds of cooldown left, 0 when not cooling down.
pub fn remaining_ms(
    credential: &Credential,
    group: ModelGroup,
    settings: &CooldownSettings,
    now: u64,
) -> u64 {
    let length = settings.length_ms(group);
    if length == 0 {
        return 0;
    }
    match credential.group_last_used.get(group) {
        Some(last_used) => last_used.saturating_add(length).saturating_sub(now),
        None => 0,
    }
}

/// Last-use timestamp that leaves exactly `delay_ms` of cooldown at `now`.
///
/// Returns None for a group whose configured cooldown is 0; such groups are
/// never adjusted.
pub fn backdated_last_used(now: u64, delay_ms: u64, configured_ms: u64) -> Option<u64> {
    if configured_ms == 0 {
        return None;
    }
    Some(now.saturating_add(delay_ms).saturating_sub(configured_ms))
}
