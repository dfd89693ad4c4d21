//! Constraint engine.
//!
//! Three ordered rule sets steer plugin selection:
//!
//! - **include**: a match short-circuits to keep
//! - **exclude**: a match (with no include hit) short-circuits to drop
//! - **in**: when any in-rules exist, a plugin must match one to be kept
//!
//! Rules are normalized on entry and de-duplicated by their raw form.

use std::collections::BTreeSet;

use loadout_types::{ConstraintKind, ConstraintRule};

use loadout_store::ConstraintDoc;

/// In-memory snapshot of the constraint rule sets.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    include: Vec<ConstraintRule>,
    exclude: Vec<ConstraintRule>,
    within: Vec<ConstraintRule>,
}

impl Constraints {
    /// Rebuild from store documents.
    pub fn from_docs(docs: &[ConstraintDoc]) -> Self {
        let mut constraints = Self::default();
        for doc in docs {
            constraints.add(doc.kind, std::iter::once(doc.data.as_str()));
        }
        constraints
    }

    fn set_mut(&mut self, kind: ConstraintKind) -> &mut Vec<ConstraintRule> {
        match kind {
            ConstraintKind::Include => &mut self.include,
            ConstraintKind::Exclude => &mut self.exclude,
            ConstraintKind::In => &mut self.within,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty() && self.within.is_empty()
    }

    /// Add rules; returns the normalized raw forms that were actually new.
    pub fn add<'a>(
        &mut self,
        kind: ConstraintKind,
        raws: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let set = self.set_mut(kind);
        let existing: BTreeSet<String> = set.iter().map(|r| r.raw.clone()).collect();

        let mut added = Vec::new();
        for raw in raws {
            let rule = ConstraintRule::parse(raw);
            if rule.raw.is_empty() || existing.contains(&rule.raw) || added.contains(&rule.raw) {
                continue;
            }
            added.push(rule.raw.clone());
            set.push(rule);
        }

        added
    }

    /// Remove rules by raw form; `kind` narrows to one set. Returns the
    /// normalized raw forms that were actually removed.
    pub fn remove<'a>(
        &mut self,
        kind: Option<ConstraintKind>,
        raws: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let targets: BTreeSet<String> = raws
            .into_iter()
            .map(|raw| ConstraintRule::parse(raw).raw)
            .collect();

        let mut removed = Vec::new();
        for k in [
            ConstraintKind::Include,
            ConstraintKind::Exclude,
            ConstraintKind::In,
        ] {
            if kind.is_some_and(|want| want != k) {
                continue;
            }

            let set = self.set_mut(k);
            set.retain(|rule| {
                if targets.contains(&rule.raw) {
                    removed.push(rule.raw.clone());
                    false
                } else {
                    true
                }
            });
        }

        removed
    }

    /// Drop every rule, or every rule of one kind. Returns whether anything
    /// was dropped.
    pub fn clear(&mut self, kind: Option<ConstraintKind>) -> bool {
        let mut dropped = false;
        for k in [
            ConstraintKind::Include,
            ConstraintKind::Exclude,
            ConstraintKind::In,
        ] {
            if kind.is_some_and(|want| want != k) {
                continue;
            }
            let set = self.set_mut(k);
            dropped |= !set.is_empty();
            set.clear();
        }
        dropped
    }

    /// All rules as `kind:raw` strings, for the RPC listing.
    pub fn list(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (kind, set) in [
            (ConstraintKind::Include, &self.include),
            (ConstraintKind::Exclude, &self.exclude),
            (ConstraintKind::In, &self.within),
        ] {
            out.extend(set.iter().map(|rule| format!("{kind}:{}", rule.raw)));
        }
        out
    }

    /// Decide whether a plugin passes the constraint sets.
    ///
    /// Returns `None` to keep, or the drop reason. Inputs must already be
    /// lower-cased.
    pub fn check(&self, repo: &str, category: &str, plugin: &str) -> Option<String> {
        if self.include.iter().any(|r| r.matches(repo, category, plugin)) {
            return None;
        }

        if let Some(rule) = self
            .exclude
            .iter()
            .find(|r| r.matches(repo, category, plugin))
        {
            return Some(format!("excluded by constraint ({})", rule.raw));
        }

        if !self.within.is_empty()
            && !self.within.iter().any(|r| r.matches(repo, category, plugin))
        {
            return Some("not matched by any in-constraint".to_string());
        }

        None
    }
}
