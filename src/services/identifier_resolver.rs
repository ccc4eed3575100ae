//! Identifier Resolver
//!
//! Turns the names and codes people type (units, places, agents, budget allocations...) into
//! stable integer ids, creating the lookup row on first use. Safe to call concurrently: a
//! caller that loses the insert race reads the winner's row instead of failing.

use metrics::counter;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::db::DbPool;
use crate::entities::lookup_entry::{self, Entity as LookupEntry, LookupKind};
use crate::errors::{is_unique_violation, ServiceError};
use crate::events::{Event, EventSender};

/// Whether `resolve` inserted the row or found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolveOutcome {
    Created,
    AlreadyExisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub id: i32,
    pub outcome: ResolveOutcome,
}

impl Resolution {
    pub fn created(&self) -> bool {
        self.outcome == ResolveOutcome::Created
    }
}

/// How many extra lookup/insert rounds follow a lost insert race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

#[derive(Clone)]
pub struct IdentifierResolver {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    retry_policy: RetryPolicy,
}

impl IdentifierResolver {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender, retry_policy: RetryPolicy) -> Self {
        Self {
            db_pool,
            event_sender,
            retry_policy,
        }
    }

    /// Resolves `natural_key` to the id of its `kind` lookup row, creating the row if needed.
    ///
    /// Keys are matched exactly after trimming surrounding whitespace. A previously deactivated
    /// row with the same key is reactivated rather than duplicated.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        kind: LookupKind,
        natural_key: &str,
    ) -> Result<Resolution, ServiceError> {
        let key = natural_key.trim();
        if key.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "{} name must not be empty",
                kind
            )));
        }

        let db = &*self.db_pool;
        let attempts = self.retry_policy.max_retries + 1;

        for attempt in 1..=attempts {
            if let Some(existing) = self.find_active(kind, key).await? {
                return Ok(Resolution {
                    id: existing.id,
                    outcome: ResolveOutcome::AlreadyExisted,
                });
            }

            let entry = lookup_entry::ActiveModel {
                kind: Set(kind),
                natural_key: Set(key.to_string()),
                is_active: Set(true),
                ..Default::default()
            };

            match entry.insert(db).await {
                Ok(created) => {
                    counter!("procurement_resolver.created", 1, "kind" => kind.to_string());
                    info!(lookup_id = created.id, natural_key = key, "Lookup entry created");
                    self.event_sender
                        .send_or_log(Event::LookupCreated {
                            kind,
                            id: created.id,
                            natural_key: created.natural_key.clone(),
                        })
                        .await;
                    return Ok(Resolution {
                        id: created.id,
                        outcome: ResolveOutcome::Created,
                    });
                }
                Err(e) if is_unique_violation(&e) => {
                    counter!("procurement_resolver.insert_conflicts", 1, "kind" => kind.to_string());
                    warn!(attempt, natural_key = key, "Lost insert race; re-reading winner");

                    if let Some(winner) = self.find_any(kind, key).await? {
                        let winner = if winner.is_active {
                            winner
                        } else {
                            self.reactivate(winner).await?
                        };
                        return Ok(Resolution {
                            id: winner.id,
                            outcome: ResolveOutcome::AlreadyExisted,
                        });
                    }
                }
                Err(e) => return Err(ServiceError::db_error(e)),
            }
        }

        counter!("procurement_resolver.failures", 1, "kind" => kind.to_string());
        Err(ServiceError::ResolutionFailed {
            kind: kind.to_string(),
            natural_key: key.to_string(),
            attempts,
        })
    }

    /// Active entries of one kind, ordered by key.
    #[instrument(skip(self))]
    pub async fn list_lookups(&self, kind: LookupKind) -> Result<Vec<lookup_entry::Model>, ServiceError> {
        LookupEntry::find()
            .filter(lookup_entry::Column::Kind.eq(kind))
            .filter(lookup_entry::Column::IsActive.eq(true))
            .order_by_asc(lookup_entry::Column::NaturalKey)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn get_lookup(&self, id: i32) -> Result<lookup_entry::Model, ServiceError> {
        LookupEntry::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Lookup entry {} not found", id)))
    }

    /// Hides an entry from resolution and listing. Its id stays valid for existing references.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, id: i32) -> Result<lookup_entry::Model, ServiceError> {
        let entry = self.get_lookup(id).await?;
        let mut active: lookup_entry::ActiveModel = entry.into();
        active.is_active = Set(false);
        let updated = active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        info!(lookup_id = id, "Lookup entry deactivated");
        Ok(updated)
    }

    async fn find_active(
        &self,
        kind: LookupKind,
        key: &str,
    ) -> Result<Option<lookup_entry::Model>, ServiceError> {
        LookupEntry::find()
            .filter(lookup_entry::Column::Kind.eq(kind))
            .filter(lookup_entry::Column::NaturalKey.eq(key))
            .filter(lookup_entry::Column::IsActive.eq(true))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn find_any(
        &self,
        kind: LookupKind,
        key: &str,
    ) -> Result<Option<lookup_entry::Model>, ServiceError> {
        LookupEntry::find()
            .filter(lookup_entry::Column::Kind.eq(kind))
            .filter(lookup_entry::Column::NaturalKey.eq(key))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn reactivate(
        &self,
        entry: lookup_entry::Model,
    ) -> Result<lookup_entry::Model, ServiceError> {
        let id = entry.id;
        let mut active: lookup_entry::ActiveModel = entry.into();
        active.is_active = Set(true);
        let updated = active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        info!(lookup_id = id, "Lookup entry reactivated");
        Ok(updated)
    }
}
