//! Currency skip-unlock transactions.
//!
//! An unlock debits the learner, appends a [`LedgerEntry`] and marks the
//! course `unblocked`, all in one store commit. Every write carries the
//! version observed when reading, so two sessions racing on the same balance
//! cannot both succeed: the loser gets a conflict, re-reads, and then fails
//! on funds.

use std::sync::Arc;

use chrono::Utc;
use coursegate_shared::{
    Catalogue, CourseGatingState, CourseId, CourseStatus, Learner, LearnerId, LedgerEntry,
};
use coursegate_store::{paths, Precondition, ProgressStore, WriteBatch};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::gating::{GatingResolver, LearnerFacts};

/// Successful unlock.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UnlockReceipt {
    pub entry: LedgerEntry,
    pub new_balance: u64,
}

pub struct UnlockLedger {
    store: Arc<dyn ProgressStore>,
    resolver: Arc<GatingResolver>,
    config: EngineConfig,
}

impl UnlockLedger {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        resolver: Arc<GatingResolver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            config,
        }
    }

    /// Spend coins to unlock `course` for `learner`.
    ///
    /// A conflicting concurrent update (or a timeout) is retried once with
    /// fresh reads before being surfaced as [`EngineError::Conflict`]. Both
    /// attempts write the same ledger entry id, so a commit that landed after
    /// its attempt timed out is reported as the success it was.
    pub async fn unlock(&self, learner: &LearnerId, course: &CourseId) -> Result<UnlockReceipt> {
        let entry_id = Uuid::new_v4();
        match self.attempt_with_timeout(learner, course, entry_id).await {
            Err(EngineError::Conflict) => {
                if let Some(receipt) = self.committed_receipt(learner, &entry_id).await? {
                    return Ok(receipt);
                }
                warn!(learner = %learner, course = %course, "unlock conflicted, retrying once");
                match self.attempt_with_timeout(learner, course, entry_id).await {
                    Ok(receipt) => Ok(receipt),
                    // The first commit may have landed while the retry was
                    // reading.
                    Err(e) => match self.committed_receipt(learner, &entry_id).await? {
                        Some(receipt) => Ok(receipt),
                        None => Err(e),
                    },
                }
            }
            other => other,
        }
    }

    /// Receipt for an entry that is already stored, if any.
    async fn committed_receipt(
        &self,
        learner: &LearnerId,
        entry_id: &Uuid,
    ) -> Result<Option<UnlockReceipt>> {
        let Some(doc) = self.store.get(&paths::ledger_entry(learner, entry_id)).await? else {
            return Ok(None);
        };
        let entry: LedgerEntry = doc.decode()?;
        info!(
            learner = %learner,
            course = %entry.course_id,
            entry = %entry.id,
            "unlock committed despite timeout"
        );
        Ok(Some(UnlockReceipt {
            new_balance: entry.balance_after,
            entry,
        }))
    }

    async fn attempt_with_timeout(
        &self,
        learner: &LearnerId,
        course: &CourseId,
        entry_id: Uuid,
    ) -> Result<UnlockReceipt> {
        let attempt = self.attempt(learner, course, entry_id);
        match tokio::time::timeout(self.config.unlock_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    learner = %learner,
                    course = %course,
                    timeout = ?self.config.unlock_timeout,
                    "unlock transaction timed out"
                );
                Err(EngineError::Conflict)
            }
        }
    }

    async fn attempt(
        &self,
        learner_id: &LearnerId,
        course_id: &CourseId,
        entry_id: Uuid,
    ) -> Result<UnlockReceipt> {
        let learner_path = paths::learner(learner_id);
        let Some(learner_doc) = self.store.get(&learner_path).await? else {
            error!(learner = %learner_id, "unlock requested for unknown learner");
            return Err(EngineError::NotFound(format!("learner {learner_id}")));
        };
        let learner: Learner = learner_doc.decode()?;

        let course = match self.resolver.catalogue().course(course_id).await {
            Ok(course) => course,
            Err(e) => {
                error!(course = %course_id, error = %e, "unlock requested for unavailable course");
                return Err(e);
            }
        };
        let cost = self.config.unlock_cost(&course);

        let facts = self.resolver.load_facts(learner_id).await?;
        let catalogue = self.resolver.catalogue().catalogue().await?;
        if let Some(previous) = catalogue.previous(course_id) {
            if !self.reached_by_progress(&facts, &catalogue, previous).await? {
                return Err(EngineError::NotEligible(course_id.to_string()));
            }
        }

        if learner.balance < cost {
            info!(
                learner = %learner_id,
                course = %course_id,
                balance = learner.balance,
                cost,
                "unlock rejected: insufficient funds"
            );
            return Err(EngineError::InsufficientFunds {
                balance: learner.balance,
                cost,
            });
        }

        let snapshot = self.resolver.resolve_with(&facts, course_id).await?;
        if snapshot.is_accessible() {
            return Err(EngineError::AlreadyUnlocked(course_id.to_string()));
        }

        let state_path = paths::course_state(learner_id, course_id);
        let state_doc = self.store.get(&state_path).await?;

        let now = Utc::now();
        let new_balance = learner.balance - cost;
        let entry = LedgerEntry {
            id: entry_id,
            learner_id: learner_id.clone(),
            course_id: course_id.clone(),
            cost,
            balance_after: new_balance,
            at: now,
        };
        let debited = Learner {
            balance: new_balance,
            ..learner
        };
        let state = CourseGatingState {
            status: CourseStatus::Unblocked,
            updated_at: now,
        };

        let batch = WriteBatch::new()
            .set_model(&learner_path, &debited, Precondition::Version(learner_doc.version))?
            .set_model(
                paths::ledger_entry(learner_id, &entry.id),
                &entry,
                Precondition::Absent,
            )?
            .set_model(&state_path, &state, Precondition::observed(state_doc.as_ref()))?;

        self.store.commit(batch).await?;

        info!(
            learner = %learner_id,
            course = %course_id,
            cost,
            new_balance,
            entry = %entry.id,
            "course unlocked with coins"
        );

        Ok(UnlockReceipt { entry, new_balance })
    }

    /// Whether the learner got into `course` through their own progress
    /// rather than a purchase. Only such a course opens the one after it for
    /// purchase, so skip-unlocks never chain.
    async fn reached_by_progress(
        &self,
        facts: &LearnerFacts,
        catalogue: &Catalogue,
        course: &CourseId,
    ) -> Result<bool> {
        let snapshot = self.resolver.resolve_with(facts, course).await?;
        Ok(match snapshot.course {
            CourseStatus::Blocked => false,
            CourseStatus::InProgress | CourseStatus::Completed => true,
            CourseStatus::Unblocked => match catalogue.previous(course) {
                None => true,
                Some(before) => {
                    self.resolver.resolve_with(facts, before).await?.course
                        == CourseStatus::Completed
                }
            },
        })
    }

    /// Current coin balance.
    pub async fn balance(&self, learner: &LearnerId) -> Result<u64> {
        let doc = self
            .store
            .get(&paths::learner(learner))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("learner {learner}")))?;
        Ok(doc.decode::<Learner>()?.balance)
    }

    /// Ledger entries of a learner, oldest first.
    pub async fn history(&self, learner: &LearnerId) -> Result<Vec<LedgerEntry>> {
        let docs = self.store.list(&paths::ledger_prefix(learner)).await?;
        let mut entries = Vec::with_capacity(docs.len());
        for doc in docs {
            entries.push(doc.decode::<LedgerEntry>()?);
        }
        entries.sort_by_key(|e| e.at);
        Ok(entries)
    }

    /// Add coins to a learner's balance, creating the account on first
    /// credit. This is the hook for external reward and purchase flows.
    pub async fn credit(&self, learner: &LearnerId, amount: u64) -> Result<u64> {
        match self.try_credit(learner, amount).await {
            Err(EngineError::Conflict) => self.try_credit(learner, amount).await,
            other => other,
        }
    }

    async fn try_credit(&self, learner_id: &LearnerId, amount: u64) -> Result<u64> {
        let path = paths::learner(learner_id);
        let doc = self.store.get(&path).await?;
        let mut learner = match doc.as_ref() {
            Some(doc) => doc.decode::<Learner>()?,
            None => Learner {
                id: learner_id.clone(),
                balance: 0,
                subscribed: false,
            },
        };
        learner.balance = learner
            .balance
            .checked_add(amount)
            .ok_or_else(|| EngineError::InvalidInput("balance overflow".into()))?;

        let batch =
            WriteBatch::new().set_model(&path, &learner, Precondition::observed(doc.as_ref()))?;
        self.store.commit(batch).await?;

        info!(learner = %learner_id, amount, balance = learner.balance, "coins credited");
        Ok(learner.balance)
    }
}
