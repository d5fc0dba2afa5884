//! Database operations for the companion mediation service.
//!
//! All shared state (the daily usage ledger, the rate window, the breaker
//! document, safety flags, and generation tasks) lives in MongoDB and is
//! mutated only through server-side atomic updates: guarded `$inc` for
//! counters, version-checked swaps for the breaker, first-writer-wins
//! inserts for tasks. Handlers are stateless, so nothing here may
//! read-modify-write in process memory.

use crate::models::{
    ActivityRecord, BreakerState, DayKey, GenerationTask, RateWindow, SafetyFlag, UsageRecord,
    UserRecord, WeekKey, BREAKER_DOC_ID, RATE_WINDOW_DOC_ID,
};
use crate::services::flags::FlagStore;
use crate::services::gateway::{CallSource, GatewayStore, QuotaDecision, RateDecision};
use crate::services::reports::ReportStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, Bson},
    options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;

#[derive(Clone)]
pub struct CompanionDb {
    client: MongoClient,
    db: Database,
}

impl CompanionDb {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!(uri = %uri, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB at {}: {}", uri, e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for companion-service");

        // Flag lookback queries by (user, recency)
        let flag_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("user_created_idx".to_string())
                    .build(),
            )
            .build();
        self.safety_flags()
            .create_index(flag_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create safety flag index: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        // Activity range scans per user
        let activity_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "completed_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("user_completed_idx".to_string())
                    .build(),
            )
            .build();
        self.activities()
            .create_index(activity_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create activity index: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        // Per-user listings of generated reports
        for (name, collection) in [
            ("daily", self.daily_summaries()),
            ("weekly", self.weekly_reports()),
        ] {
            let index = IndexModel::builder()
                .keys(doc! { "user_id": 1 })
                .options(
                    IndexOptions::builder()
                        .name("user_idx".to_string())
                        .build(),
                )
                .build();
            collection.create_index(index, None).await.map_err(|e| {
                tracing::error!("Failed to create {} report index: {}", name, e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        }

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    // Collection accessors

    pub fn usage(&self) -> Collection<UsageRecord> {
        self.db.collection("usage")
    }

    pub fn rate_windows(&self) -> Collection<RateWindow> {
        self.db.collection("rate_window")
    }

    pub fn breaker(&self) -> Collection<BreakerState> {
        self.db.collection("breaker")
    }

    pub fn safety_flags(&self) -> Collection<SafetyFlag> {
        self.db.collection("safety_flags")
    }

    pub fn users(&self) -> Collection<UserRecord> {
        self.db.collection("users")
    }

    pub fn activities(&self) -> Collection<ActivityRecord> {
        self.db.collection("activities")
    }

    pub fn daily_summaries(&self) -> Collection<GenerationTask> {
        self.db.collection("daily_summaries")
    }

    pub fn weekly_reports(&self) -> Collection<GenerationTask> {
        self.db.collection("weekly_reports")
    }
}

/// Whether a write failed because a document with the same `_id` exists.
fn is_duplicate_key_error(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        ErrorKind::Command(command_error) => command_error.code == 11000,
        _ => false,
    }
}

fn db_error(context: &str, e: impl std::fmt::Display) -> AppError {
    tracing::error!("{}: {}", context, e);
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

#[async_trait]
impl GatewayStore for CompanionDb {
    async fn reserve_quota(
        &self,
        day: &DayKey,
        source: CallSource,
        daily_limit: i64,
    ) -> Result<QuotaDecision, AppError> {
        // Guarded atomic increment: the filter only matches while the day
        // is under its cap, and the upsert creates the day's record on
        // first use. An upsert losing to an at-cap document surfaces as a
        // duplicate key error, which is a denial, not a failure.
        let filter = doc! {
            "_id": day.usage_doc_id(),
            "total_calls": { "$lt": daily_limit },
        };
        let mut inc = doc! { "total_calls": 1i64 };
        inc.insert(format!("per_source.{}", source.as_str()), 1i64);
        let update = doc! {
            "$inc": inc,
            "$setOnInsert": { "day": day.to_string(), "daily_limit": daily_limit },
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        match self.usage().find_one_and_update(filter, update, options).await {
            Ok(Some(record)) => Ok(QuotaDecision::Allowed {
                remaining: record.remaining(),
            }),
            Ok(None) => Ok(QuotaDecision::Denied),
            Err(e) if is_duplicate_key_error(&e) => Ok(QuotaDecision::Denied),
            Err(e) => Err(db_error("Failed to reserve quota", e)),
        }
    }

    async fn usage_for_day(&self, day: &DayKey) -> Result<Option<UsageRecord>, AppError> {
        self.usage()
            .find_one(doc! { "_id": day.usage_doc_id() }, None)
            .await
            .map_err(|e| db_error("Failed to read usage record", e))
    }

    async fn admit_rate(
        &self,
        now: DateTime<Utc>,
        window_seconds: i64,
        limit_per_window: i64,
    ) -> Result<RateDecision, AppError> {
        let window_ms = window_seconds * 1000;
        let now_ms = now.timestamp_millis();
        let window_start = (now_ms / window_ms) * window_ms;

        // Fast path: same window, still under the limit.
        let filter = doc! {
            "_id": RATE_WINDOW_DOC_ID,
            "window_start_ms": window_start,
            "count": { "$lt": limit_per_window },
        };
        let update = doc! { "$inc": { "count": 1i64 } };
        let admitted = self
            .rate_windows()
            .find_one_and_update(filter, update, None)
            .await
            .map_err(|e| db_error("Failed to update rate window", e))?;
        if admitted.is_some() {
            return Ok(RateDecision::Allowed);
        }

        // Roll the window over (or create it on first use). If the
        // document already carries the current window, the filter misses
        // and the upsert collides on _id: the window is full.
        let filter = doc! {
            "_id": RATE_WINDOW_DOC_ID,
            "window_start_ms": { "$ne": window_start },
        };
        let update = doc! {
            "$set": {
                "window_start_ms": window_start,
                "count": 1i64,
                "limit_per_window": limit_per_window,
            },
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        match self
            .rate_windows()
            .find_one_and_update(filter, update, options)
            .await
        {
            Ok(_) => return Ok(RateDecision::Allowed),
            Err(e) if is_duplicate_key_error(&e) => {}
            Err(e) => return Err(db_error("Failed to roll rate window", e)),
        }

        let window_end_ms = window_start + window_ms;
        let retry_after = (((window_end_ms - now_ms) + 999) / 1000).max(1) as u64;
        Ok(RateDecision::Denied {
            retry_after_seconds: retry_after,
        })
    }

    async fn rate_window(&self) -> Result<Option<RateWindow>, AppError> {
        self.rate_windows()
            .find_one(doc! { "_id": RATE_WINDOW_DOC_ID }, None)
            .await
            .map_err(|e| db_error("Failed to read rate window", e))
    }

    async fn load_breaker(&self) -> Result<BreakerState, AppError> {
        let filter = doc! { "_id": BREAKER_DOC_ID };
        let update = doc! {
            "$setOnInsert": {
                "phase": "closed",
                "opens_until": Bson::Null,
                "consecutive_failures": 0i64,
                "version": 0i64,
            },
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        match self
            .breaker()
            .find_one_and_update(filter, update, options)
            .await
        {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Ok(BreakerState::initial()),
            // Lost an upsert race; the document exists now.
            Err(e) if is_duplicate_key_error(&e) => self
                .breaker()
                .find_one(doc! { "_id": BREAKER_DOC_ID }, None)
                .await
                .map_err(|e| db_error("Failed to load breaker state", e))?
                .ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!("breaker document vanished"))
                }),
            Err(e) => Err(db_error("Failed to load breaker state", e)),
        }
    }

    async fn cas_breaker(
        &self,
        expected_version: i64,
        next: &BreakerState,
    ) -> Result<bool, AppError> {
        let phase = bson::to_bson(&next.phase)
            .map_err(|e| db_error("Failed to serialize breaker phase", e))?;
        let opens_until = match next.opens_until {
            Some(ms) => Bson::Int64(ms),
            None => Bson::Null,
        };
        let filter = doc! { "_id": BREAKER_DOC_ID, "version": expected_version };
        let update = doc! {
            "$set": {
                "phase": phase,
                "opens_until": opens_until,
                "consecutive_failures": next.consecutive_failures,
                "version": expected_version + 1,
            },
        };
        let result = self
            .breaker()
            .update_one(filter, update, None)
            .await
            .map_err(|e| db_error("Failed to swap breaker state", e))?;
        Ok(result.matched_count == 1)
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.health_check().await
    }
}

#[async_trait]
impl FlagStore for CompanionDb {
    async fn append(&self, flag: &SafetyFlag) -> Result<(), AppError> {
        self.safety_flags()
            .insert_one(flag, None)
            .await
            .map_err(|e| db_error("Failed to append safety flag", e))?;
        Ok(())
    }

    async fn has_recent_flag(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let filter = doc! {
            "user_id": user_id,
            "created_at": { "$gte": since.timestamp_millis() },
        };
        let count = self
            .safety_flags()
            .count_documents(filter, None)
            .await
            .map_err(|e| db_error("Failed to query recent flags", e))?;
        Ok(count > 0)
    }
}

#[async_trait]
impl ReportStore for CompanionDb {
    async fn list_user_ids(&self) -> Result<Vec<String>, AppError> {
        let cursor = self
            .users()
            .find(None, None)
            .await
            .map_err(|e| db_error("Failed to list users", e))?;
        let users: Vec<UserRecord> = cursor
            .try_collect()
            .await
            .map_err(|e| db_error("Failed to collect users", e))?;
        Ok(users.into_iter().map(|u| u.id).collect())
    }

    async fn activities_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, AppError> {
        let filter = doc! {
            "user_id": user_id,
            "completed_at": {
                "$gte": start.timestamp_millis(),
                "$lt": end.timestamp_millis(),
            },
        };
        let cursor = self
            .activities()
            .find(filter, None)
            .await
            .map_err(|e| db_error("Failed to query activities", e))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| db_error("Failed to collect activities", e))
    }

    async fn find_daily_summary(
        &self,
        user_id: &str,
        day: &DayKey,
    ) -> Result<Option<GenerationTask>, AppError> {
        self.daily_summaries()
            .find_one(doc! { "_id": day.task_id(user_id) }, None)
            .await
            .map_err(|e| db_error("Failed to find daily summary", e))
    }

    async fn insert_daily_summary(&self, task: &GenerationTask) -> Result<bool, AppError> {
        match self.daily_summaries().insert_one(task, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key_error(&e) => Ok(false),
            Err(e) => Err(db_error("Failed to insert daily summary", e)),
        }
    }

    async fn find_weekly_report(
        &self,
        user_id: &str,
        week: &WeekKey,
    ) -> Result<Option<GenerationTask>, AppError> {
        self.weekly_reports()
            .find_one(doc! { "_id": week.task_id(user_id) }, None)
            .await
            .map_err(|e| db_error("Failed to find weekly report", e))
    }

    async fn insert_weekly_report(&self, task: &GenerationTask) -> Result<bool, AppError> {
        match self.weekly_reports().insert_one(task, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key_error(&e) => Ok(false),
            Err(e) => Err(db_error("Failed to insert weekly report", e)),
        }
    }
}
