//! Candidate bookkeeping in waves.

use std::collections::HashMap;
use std::collections::VecDeque;

use infocalypse_store::RequestTag;

/// Candidates of one state: queued in the current wave, deferred to the
/// next wave, or running by tag.
///
/// The deferred wave is promoted only once the current wave has neither
/// queued nor running candidates.
#[derive(Debug)]
pub struct RequestSet<C> {
    current: VecDeque<C>,
    next: VecDeque<C>,
    running: HashMap<RequestTag, C>,
}

impl<C> Default for RequestSet<C> {
    fn default() -> Self {
        Self {
            current: VecDeque::new(),
            next: VecDeque::new(),
            running: HashMap::new(),
        }
    }
}

impl<C> RequestSet<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue in the current wave.
    pub fn push(&mut self, candidate: C) {
        self.current.push_back(candidate);
    }

    /// Queue ahead of everything else in the current wave.
    pub fn push_front(&mut self, candidate: C) {
        self.current.push_front(candidate);
    }

    /// Queue for the next wave.
    pub fn defer(&mut self, candidate: C) {
        self.next.push_back(candidate);
    }

    /// Next candidate to start, promoting the deferred wave when the
    /// current one has drained.
    pub fn pop(&mut self) -> Option<C> {
        if self.current.is_empty() && self.running.is_empty() {
            std::mem::swap(&mut self.current, &mut self.next);
        }
        self.current.pop_front()
    }

    pub fn start(&mut self, tag: RequestTag, candidate: C) {
        self.running.insert(tag, candidate);
    }

    /// Remove a running candidate when its request completes.
    pub fn complete(&mut self, tag: &RequestTag) -> Option<C> {
        self.running.remove(tag)
    }

    /// Every candidate queued, deferred or running.
    pub fn in_play(&self) -> impl Iterator<Item = &C> {
        self.current.iter().chain(self.next.iter()).chain(self.running.values())
    }

    pub fn in_play_mut(&mut self) -> impl Iterator<Item = &mut C> {
        self.current.iter_mut().chain(self.next.iter_mut()).chain(self.running.values_mut())
    }

    /// Drop queued candidates matching `pred`, keeping running ones.
    pub fn retain_queued(&mut self, mut pred: impl FnMut(&C) -> bool) {
        self.current.retain(&mut pred);
        self.next.retain(&mut pred);
    }

    /// Tags of running candidates matching `pred`, removed from the set.
    pub fn detach_running(&mut self, mut pred: impl FnMut(&C) -> bool) -> Vec<RequestTag> {
        let tags: Vec<RequestTag> =
            self.running.iter().filter(|(_, candidate)| pred(candidate)).map(|(tag, _)| tag.clone()).collect();
        for tag in &tags {
            self.running.remove(tag);
        }
        tags
    }

    /// Empty everything queued and running, returning the running tags.
    pub fn clear(&mut self) -> Vec<RequestTag> {
        self.current.clear();
        self.next.clear();
        self.running.drain().map(|(tag, _)| tag).collect()
    }

    /// Nothing queued, deferred or running.
    pub fn is_idle(&self) -> bool {
        self.current.is_empty() && self.next.is_empty() && self.running.is_empty()
    }
}
