//! Pending challenges and one-shot passes.
//!
//! A challenge action stores the hit under the client fingerprint together
//! with a generated question. Solving it removes the record. A solved
//! group-policy challenge leaves a pass that lets exactly one later request
//! from the same fingerprint through; a solved flood challenge leaves none,
//! its counters are cleared instead.
//! Every wrong answer replaces the question, and the record is dropped after
//! `MAX_ATTEMPTS` wrong answers.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::time::Instant;

use crate::firewall::{HitInfo, HitKind};

pub const MAX_ATTEMPTS: u32 = 3;

/// Question shown on the challenge page and its expected answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub prompt: String,
    pub answer: String,
}

pub trait ChallengeProvider: Send + Sync {
    fn generate(&self) -> Question;
}

/// Small addition problems.
#[derive(Debug, Default)]
pub struct ArithmeticChallenge;

impl ChallengeProvider for ArithmeticChallenge {
    fn generate(&self) -> Question {
        let mut rng = rand::thread_rng();
        let a: u32 = rng.gen_range(1..=20);
        let b: u32 = rng.gen_range(1..=20);
        Question {
            prompt: format!("{a} + {b} = ?"),
            answer: (a + b).to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub hit: HitInfo,
    pub app_id: i64,
    pub question: Question,
    attempts: u32,
    expires_at: Instant,
}

#[derive(Debug)]
pub enum ChallengeOutcome {
    Solved(PendingChallenge),
    /// A new question was generated.
    Wrong,
    /// Too many wrong answers; the record is gone.
    Exhausted,
    /// No record, or the record outlived its TTL.
    Expired,
}

pub struct ChallengeStore {
    pending: DashMap<String, PendingChallenge>,
    passes: DashMap<String, Instant>,
    ttl: Duration,
    provider: Box<dyn ChallengeProvider>,
}

impl ChallengeStore {
    pub fn new(ttl: Duration, provider: Box<dyn ChallengeProvider>) -> Self {
        Self {
            pending: DashMap::new(),
            passes: DashMap::new(),
            ttl,
            provider,
        }
    }

    /// Store (or replace) the record for `hit.client_id`. Returns the id the
    /// client is redirected with.
    pub fn issue(&self, hit: HitInfo, app_id: i64) -> String {
        let id = hit.client_id.clone();
        let record = PendingChallenge {
            hit,
            app_id,
            question: self.provider.generate(),
            attempts: 0,
            expires_at: Instant::now() + self.ttl,
        };
        self.pending.insert(id.clone(), record);
        id
    }

    pub fn question(&self, id: &str) -> Option<String> {
        let record = self.pending.get(id)?;
        (record.expires_at > Instant::now()).then(|| record.question.prompt.clone())
    }

    pub fn verify(&self, id: &str, answer: &str) -> ChallengeOutcome {
        let now = Instant::now();
        {
            let Some(mut record) = self.pending.get_mut(id) else {
                return ChallengeOutcome::Expired;
            };
            if record.expires_at <= now {
                drop(record);
                self.pending.remove(id);
                return ChallengeOutcome::Expired;
            }
            if answer.trim() != record.question.answer {
                record.attempts += 1;
                if record.attempts >= MAX_ATTEMPTS {
                    drop(record);
                    self.pending.remove(id);
                    return ChallengeOutcome::Exhausted;
                }
                record.question = self.provider.generate();
                return ChallengeOutcome::Wrong;
            }
        }

        match self.pending.remove(id) {
            Some((_, record)) => {
                if record.hit.kind == HitKind::Group {
                    self.passes.insert(id.to_string(), now + self.ttl);
                }
                ChallengeOutcome::Solved(record)
            }
            // Solved concurrently by another request.
            None => ChallengeOutcome::Expired,
        }
    }

    /// Take the pass for `client_id`, if one is live.
    pub fn consume_pass(&self, client_id: &str) -> bool {
        self.passes
            .remove(client_id)
            .is_some_and(|(_, expires_at)| expires_at > Instant::now())
    }

    /// Drop expired records and passes. Returns how many entries were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.pending.len() + self.passes.len();
        self.pending.retain(|_, record| record.expires_at > now);
        self.passes.retain(|_, expires_at| *expires_at > now);
        before - (self.pending.len() + self.passes.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for ChallengeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeStore")
            .field("pending", &self.pending.len())
            .field("passes", &self.passes.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::PolicyAction;

    struct Fixed;

    impl ChallengeProvider for Fixed {
        fn generate(&self) -> Question {
            Question { prompt: "2 + 2 = ?".into(), answer: "4".into() }
        }
    }

    fn hit(client_id: &str) -> HitInfo {
        HitInfo {
            kind: HitKind::Group,
            policy_id: 9,
            vuln_name: "Group Policy Hit".into(),
            action: PolicyAction::Challenge,
            client_id: client_id.into(),
            target_url: "/search?q=1".into(),
            block_time: 0,
        }
    }

    fn store() -> ChallengeStore {
        ChallengeStore::new(Duration::from_secs(300), Box::new(Fixed))
    }

    #[tokio::test]
    async fn test_solved_challenge_grants_single_pass() {
        let store = store();
        let id = store.issue(hit("abc"), 7);
        assert_eq!(store.question(&id).as_deref(), Some("2 + 2 = ?"));

        match store.verify(&id, " 4 ") {
            ChallengeOutcome::Solved(record) => {
                assert_eq!(record.app_id, 7);
                assert_eq!(record.hit.target_url, "/search?q=1");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        assert!(store.consume_pass("abc"));
        assert!(!store.consume_pass("abc"));
    }

    #[tokio::test]
    async fn test_solved_flood_challenge_leaves_no_pass() {
        let store = store();
        let flood = HitInfo { kind: HitKind::Flood, policy_id: 0, vuln_name: "CC".into(), ..hit("abc") };
        let id = store.issue(flood, 7);

        assert!(matches!(store.verify(&id, "4"), ChallengeOutcome::Solved(_)));
        assert!(!store.consume_pass("abc"));
    }

    #[tokio::test]
    async fn test_replay_without_record_fails() {
        let store = store();
        let id = store.issue(hit("abc"), 1);
        assert!(matches!(store.verify(&id, "4"), ChallengeOutcome::Solved(_)));
        assert!(matches!(store.verify(&id, "4"), ChallengeOutcome::Expired));
        assert!(matches!(store.verify("unknown", "4"), ChallengeOutcome::Expired));
    }

    /// Hands out `1 + 1`, `2 + 2`, ... so each question differs.
    #[derive(Default)]
    struct Counting(std::sync::atomic::AtomicU32);

    impl ChallengeProvider for Counting {
        fn generate(&self) -> Question {
            let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            Question { prompt: format!("{n} + {n} = ?"), answer: (2 * n).to_string() }
        }
    }

    #[tokio::test]
    async fn test_wrong_answer_replaces_question() {
        let store = ChallengeStore::new(Duration::from_secs(300), Box::new(Counting::default()));
        let id = store.issue(hit("abc"), 1);
        assert_eq!(store.question(&id).as_deref(), Some("1 + 1 = ?"));

        assert!(matches!(store.verify(&id, "5"), ChallengeOutcome::Wrong));
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.question(&id).as_deref(), Some("2 + 2 = ?"));
        assert!(matches!(store.verify(&id, "2"), ChallengeOutcome::Wrong));
        assert!(!store.consume_pass("abc"));
        assert!(matches!(store.verify(&id, "6"), ChallengeOutcome::Solved(_)));
    }

    struct HighestSum;

    impl ChallengeProvider for HighestSum {
        fn generate(&self) -> Question {
            Question { prompt: "20 + 20 = ?".into(), answer: "40".into() }
        }
    }

    #[tokio::test]
    async fn test_blind_answer_sweep_fails() {
        let store = ChallengeStore::new(Duration::from_secs(300), Box::new(HighestSum));
        let id = store.issue(hit("abc"), 1);

        let outcomes: Vec<_> = (2..=40).map(|guess: u32| store.verify(&id, &guess.to_string())).collect();

        assert!(matches!(outcomes[MAX_ATTEMPTS as usize - 1], ChallengeOutcome::Exhausted));
        assert!(outcomes[MAX_ATTEMPTS as usize..].iter().all(|o| matches!(o, ChallengeOutcome::Expired)));
        assert!(!outcomes.iter().any(|o| matches!(o, ChallengeOutcome::Solved(_))));
        assert_eq!(store.pending_count(), 0);
        assert!(!store.consume_pass("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_and_sweep() {
        let store = store();
        let id = store.issue(hit("abc"), 1);
        tokio::time::advance(Duration::from_secs(301)).await;

        assert!(store.question(&id).is_none());
        assert_eq!(store.sweep(), 1);
        assert!(matches!(store.verify(&id, "4"), ChallengeOutcome::Expired));
    }

    #[test]
    fn test_arithmetic_answer_matches_prompt() {
        let question = ArithmeticChallenge.generate();
        let (lhs, _) = question.prompt.split_once(" = ").unwrap();
        let (a, b) = lhs.split_once(" + ").unwrap();
        let sum: u32 = a.parse::<u32>().unwrap() + b.parse::<u32>().unwrap();
        assert_eq!(question.answer, sum.to_string());
    }
}
