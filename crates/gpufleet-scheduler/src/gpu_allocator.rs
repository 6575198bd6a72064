//! Per-card GPU memory ledger for one node

use tracing::debug;

use crate::placement::PlacementStrategy;

/// How a workload claims GPU cards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardClaim {
    /// Each card is claimed entirely and must be untouched beforehand
    Whole {
        /// Cards requested
        cards: u64,
    },
    /// An equal memory slice is placed on each of `cards` distinct cards
    Partitioned {
        /// Cards requested
        cards: u64,
        /// Memory per card in GB
        slice_gb: u64,
    },
}

impl CardClaim {
    /// Derive the claim of a request for `cards` cards and `memory_gb` in total.
    ///
    /// Partitioned claims need a positive slice and a known card capacity;
    /// anything else falls back to whole cards. `None` when no card is requested.
    pub fn new(cards: u64, memory_gb: u64, partitioned: bool, per_card_gb: u64) -> Option<Self> {
        if cards == 0 {
            return None;
        }
        let slice_gb = memory_gb / cards;
        if partitioned && slice_gb > 0 && per_card_gb > 0 {
            Some(CardClaim::Partitioned { cards, slice_gb })
        } else {
            Some(CardClaim::Whole { cards })
        }
    }

    /// Cards requested
    pub fn cards(&self) -> u64 {
        match self {
            CardClaim::Whole { cards } | CardClaim::Partitioned { cards, .. } => *cards,
        }
    }
}

/// Memory committed on each card of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardLedger {
    per_card_gb: u64,
    usage: Vec<u64>,
}

impl CardLedger {
    /// Create a ledger of `card_count` untouched cards
    pub fn new(card_count: u64, per_card_gb: u64) -> Self {
        Self {
            per_card_gb,
            usage: vec![0; card_count as usize],
        }
    }

    /// Number of cards
    pub fn card_count(&self) -> usize {
        self.usage.len()
    }

    /// Capacity of one card in GB
    pub fn per_card_gb(&self) -> u64 {
        self.per_card_gb
    }

    /// Committed memory per card in GB
    pub fn usage(&self) -> &[u64] {
        &self.usage
    }

    /// Free memory on a card in GB
    pub fn headroom(&self, card: usize) -> u64 {
        self.usage
            .get(card)
            .map_or(0, |used| self.per_card_gb.saturating_sub(*used))
    }

    /// Whether a card holds no usage
    pub fn is_unused(&self, card: usize) -> bool {
        self.usage.get(card) == Some(&0)
    }

    /// Memory committed across all cards in GB
    pub fn total_used(&self) -> u64 {
        self.usage.iter().sum()
    }

    /// Cards holding no usage
    pub fn unused_cards(&self) -> u64 {
        self.usage.iter().filter(|u| **u == 0).count() as u64
    }

    /// Cards with at least `slice_gb` free
    pub fn cards_with_headroom(&self, slice_gb: u64) -> u64 {
        (0..self.usage.len())
            .filter(|card| self.headroom(*card) >= slice_gb)
            .count() as u64
    }

    /// Largest free memory on any single card in GB
    pub fn max_headroom(&self) -> u64 {
        (0..self.usage.len())
            .map(|card| self.headroom(card))
            .max()
            .unwrap_or(0)
    }

    /// Cards on which a claim would land, possibly fewer than requested
    pub fn plan(&self, claim: &CardClaim, strategy: &dyn PlacementStrategy) -> Vec<usize> {
        let mut chosen = Vec::with_capacity(claim.cards() as usize);
        for _ in 0..claim.cards() {
            match strategy.pick_card(self, claim, &chosen) {
                Some(card) => chosen.push(card),
                None => break,
            }
        }
        chosen
    }

    fn commit(&mut self, claim: &CardClaim, cards: &[usize]) {
        for card in cards {
            if let Some(used) = self.usage.get_mut(*card) {
                *used = match claim {
                    CardClaim::Whole { .. } => self.per_card_gb,
                    CardClaim::Partitioned { slice_gb, .. } => {
                        (*used + slice_gb).min(self.per_card_gb)
                    }
                };
            }
        }
    }

    /// Place a claim only if every card fits; the ledger is untouched otherwise
    pub fn allocate(
        &mut self,
        claim: &CardClaim,
        strategy: &dyn PlacementStrategy,
    ) -> Option<Vec<usize>> {
        let cards = self.plan(claim, strategy);
        if (cards.len() as u64) < claim.cards() {
            return None;
        }
        self.commit(claim, &cards);
        Some(cards)
    }

    /// Place as much of an existing workload's claim as still fits.
    ///
    /// Returns the cards used. Records can describe more than a node holds
    /// (edited specs, shrunk nodes); the excess is dropped.
    pub fn replay(&mut self, claim: &CardClaim, strategy: &dyn PlacementStrategy) -> Vec<usize> {
        let cards = self.plan(claim, strategy);
        if (cards.len() as u64) < claim.cards() {
            debug!(
                requested = claim.cards(),
                placed = cards.len(),
                "Existing claim exceeds node cards"
            );
        }
        self.commit(claim, &cards);
        cards
    }
}
