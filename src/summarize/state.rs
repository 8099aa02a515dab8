use std::collections::HashSet;

use crate::summarize::bullets::Bullet;

/// Accepted bullets for one run. Length never exceeds `target` and a dedup
/// key never appears twice; insertion order is emission order.
#[derive(Debug, Clone)]
pub struct SummaryState {
    bullets: Vec<Bullet>,
    keys: HashSet<String>,
    target: usize,
    complete: bool,
}

impl SummaryState {
    pub fn new(target: usize) -> Self {
        Self {
            bullets: Vec::with_capacity(target),
            keys: HashSet::new(),
            target,
            complete: false,
        }
    }

    /// Initial population from normalizer output.
    pub fn from_bullets(bullets: Vec<Bullet>, target: usize) -> Self {
        let mut state = Self::new(target);
        state.merge(bullets);
        state
    }

    /// Append one bullet. Rejected when full or when its key is taken.
    pub fn accept(&mut self, bullet: Bullet) -> bool {
        if self.is_full() || self.keys.contains(bullet.key()) {
            return false;
        }
        self.keys.insert(bullet.key().to_string());
        self.bullets.push(bullet);
        true
    }

    /// Append in order, stopping as soon as the target is reached.
    /// Returns how many were accepted.
    pub fn merge(&mut self, bullets: impl IntoIterator<Item = Bullet>) -> usize {
        let mut added = 0;
        for bullet in bullets {
            if self.is_full() {
                break;
            }
            if self.accept(bullet) {
                added += 1;
            }
        }
        added
    }

    /// Full discard-and-rewrite. Only the repair step calls this.
    pub fn replace(&mut self, bullets: Vec<Bullet>) {
        self.bullets.clear();
        self.keys.clear();
        self.complete = false;
        self.merge(bullets);
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_full(&self) -> bool {
        self.bullets.len() >= self.target
    }

    pub fn remaining(&self) -> usize {
        self.target.saturating_sub(self.bullets.len())
    }

    pub fn len(&self) -> usize {
        self.bullets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bullets.is_empty()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn bullets(&self) -> &[Bullet] {
        &self.bullets
    }

    pub fn into_bullets(self) -> Vec<Bullet> {
        self.bullets
    }
}
