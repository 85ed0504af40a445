//! Swipes, mutual-like detection and the live match list.
//!
//! A swipe is admitted by, in order: the local rate limiter, the daily
//! quota, and the one-swipe-per-ordered-pair rule. A positive swipe that
//! meets a positive reverse swipe creates the match row, which the store
//! keeps unique per unordered pair.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kindred_realtime::{ChangeFilter, EventStream, RealtimeBackend};
use kindred_shared::constants::TABLE_MATCHES;
use kindred_shared::{ChangeKind, RealtimeEvent, SwipeAction, UserId};
use kindred_store::{Match, Swipe, UserProfile};

use crate::ai::{compatibility_insight, placeholder_insight, AiClient};
use crate::backend::RelationalStore;
use crate::error::{BackendError, CoreError};
use crate::events::{deliver, Callback};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::registry::{SubscriptionHandle, SubscriptionRegistry, Teardown};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwipeRejection {
    SelfSwipe,
    RateLimited,
    DailyLimitReached,
    AlreadySwiped,
}

impl fmt::Display for SwipeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SwipeRejection::SelfSwipe => "cannot swipe on yourself",
            SwipeRejection::RateLimited => "too many swipes, slow down",
            SwipeRejection::DailyLimitReached => "daily swipe limit reached",
            SwipeRejection::AlreadySwiped => "already swiped",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwipeOutcome {
    pub accepted: bool,
    pub matched: bool,
    pub match_record: Option<Match>,
    pub reason: Option<SwipeRejection>,
}

impl SwipeOutcome {
    fn rejected(reason: SwipeRejection) -> Self {
        Self {
            accepted: false,
            matched: false,
            match_record: None,
            reason: Some(reason),
        }
    }

    fn recorded(match_record: Option<Match>) -> Self {
        Self {
            accepted: true,
            matched: match_record.is_some(),
            match_record,
            reason: None,
        }
    }
}

/// One entry of the live match list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchWithPartner {
    pub record: Match,
    pub partner: UserProfile,
}

pub type MatchListCallback = Callback<Vec<MatchWithPartner>>;

pub fn match_list_key(user: &UserId) -> String {
    format!("matches:{user}")
}

#[derive(Clone)]
pub struct MatchCoordinator {
    store: Arc<dyn RelationalStore>,
    realtime: Arc<dyn RealtimeBackend>,
    ai: Arc<dyn AiClient>,
    limiter: RateLimiter,
    registry: Arc<SubscriptionRegistry>,
}

impl MatchCoordinator {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        realtime: Arc<dyn RealtimeBackend>,
        ai: Arc<dyn AiClient>,
        limiter: RateLimiter,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            store,
            realtime,
            ai,
            limiter,
            registry,
        }
    }

    pub async fn swipe(
        &self,
        swiper: UserId,
        swiped: UserId,
        action: SwipeAction,
    ) -> Result<SwipeOutcome, CoreError> {
        if swiper == swiped {
            return Ok(SwipeOutcome::rejected(SwipeRejection::SelfSwipe));
        }

        if !self
            .limiter
            .can_proceed(&format!("{swiper}:swipe"), RateLimitConfig::SWIPE)
        {
            return Ok(SwipeOutcome::rejected(SwipeRejection::RateLimited));
        }

        let quota = self.store.swipe_quota(&swiper).await?;
        if !quota.allows_swipe() {
            debug!(user = %swiper, "Daily swipe limit reached");
            return Ok(SwipeOutcome::rejected(SwipeRejection::DailyLimitReached));
        }

        if let Some(existing) = self.store.find_swipe(&swiper, &swiped).await? {
            return self.already_swiped(&existing).await;
        }

        match self
            .store
            .insert_swipe(&Swipe::new(swiper, swiped, action))
            .await
        {
            Ok(()) => {}
            Err(BackendError::Conflict(_)) => {
                return match self.store.find_swipe(&swiper, &swiped).await? {
                    Some(existing) => self.already_swiped(&existing).await,
                    None => Ok(SwipeOutcome::rejected(SwipeRejection::AlreadySwiped)),
                };
            }
            Err(e) => return Err(e.into()),
        }

        if !quota.is_premium {
            match self.store.decrement_daily_swipes(&swiper).await {
                Ok(true) => {}
                Ok(false) => debug!(user = %swiper, "Swipe counter already at zero"),
                Err(e) => warn!(user = %swiper, error = %e, "Failed to decrement swipe counter"),
            }
        }

        if !action.is_positive() {
            return Ok(SwipeOutcome::recorded(None));
        }
        let record = self.match_if_mutual(swiper, swiped).await?;
        Ok(SwipeOutcome::recorded(record))
    }

    /// A repeated swipe is not recorded again, but a positive one still
    /// finishes the mutual-like check an earlier attempt may have dropped.
    async fn already_swiped(&self, existing: &Swipe) -> Result<SwipeOutcome, CoreError> {
        let mut outcome = SwipeOutcome::rejected(SwipeRejection::AlreadySwiped);
        if existing.action.is_positive() {
            if let Some(record) = self
                .match_if_mutual(existing.swiper_id, existing.swiped_id)
                .await?
            {
                outcome.matched = true;
                outcome.match_record = Some(record);
            }
        }
        Ok(outcome)
    }

    /// The active match for the pair when `swiped` also liked `swiper`.
    /// Store failures surface as errors so the caller can retry the swipe.
    async fn match_if_mutual(
        &self,
        swiper: UserId,
        swiped: UserId,
    ) -> Result<Option<Match>, CoreError> {
        let reverse = self.store.find_swipe(&swiped, &swiper).await?;
        if !reverse.is_some_and(|r| r.action.is_positive()) {
            return Ok(None);
        }

        let record = self.create_match(swiper, swiped).await?;
        // An unmatched pair stays unmatched; a fresh like does not revive it.
        Ok(record.is_active.then_some(record))
    }

    /// Return the pair's match row, creating it if none exists yet.
    pub async fn create_match(&self, a: UserId, b: UserId) -> Result<Match, CoreError> {
        if let Some(existing) = self.store.match_for_pair(&a, &b).await? {
            return Ok(existing);
        }

        let insight = match (self.store.profile(&a).await, self.store.profile(&b).await) {
            (Ok(pa), Ok(pb)) => compatibility_insight(self.ai.as_ref(), &pa, &pb).await,
            _ => placeholder_insight(),
        };

        match self.store.create_match_if_not_exists(&a, &b, &insight).await {
            Ok((record, created)) => {
                if created {
                    info!(id = %record.id, score = record.compatibility_score, "New match");
                }
                Ok(record)
            }
            Err(BackendError::Conflict(_)) => self
                .store
                .match_for_pair(&a, &b)
                .await?
                .ok_or(CoreError::Backend(BackendError::NotFound)),
            Err(e) => Err(e.into()),
        }
    }

    /// Active matches of `user` with partner profiles, newest first.
    /// Matches whose partner profile cannot be read are skipped.
    pub async fn active_matches(&self, user: &UserId) -> Result<Vec<MatchWithPartner>, CoreError> {
        let records = self.store.active_matches(user).await?;
        let mut list = Vec::with_capacity(records.len());
        for record in records {
            let partner_id = record.partner_of(user);
            match self.store.profile(&partner_id).await {
                Ok(partner) => list.push(MatchWithPartner { record, partner }),
                Err(e) => warn!(partner = %partner_id, error = %e, "Skipping match without profile"),
            }
        }
        Ok(list)
    }

    pub async fn unmatch(&self, match_id: Uuid) -> Result<Match, CoreError> {
        let record = self.store.deactivate_match(match_id).await?;
        info!(id = %match_id, "Match deactivated");
        Ok(record)
    }

    /// Live list of `user`'s active matches.
    pub async fn subscribe(&self, user: UserId, callback: MatchListCallback) -> SubscriptionHandle {
        let key = match_list_key(&user);
        let this = self.clone();
        let subscription_key = key.clone();
        let key = self
            .registry
            .subscribe(&key, move || async move {
                this.open(subscription_key, user, callback).await
            })
            .await;
        SubscriptionHandle::new(key, self.registry.clone())
    }

    async fn open(&self, key: String, user: UserId, callback: MatchListCallback) -> Teardown {
        let feed = self.realtime.changes(
            TABLE_MATCHES,
            ChangeFilter::eq("user1_id", user)
                .or_eq("user2_id", user)
                .kinds(&[ChangeKind::Insert, ChangeKind::Update]),
        );

        self.reload(&key, &user, &callback).await;

        let task = tokio::spawn(self.clone().run(key, user, feed, callback));
        Teardown::new(move || task.abort())
    }

    async fn run(self, key: String, user: UserId, mut feed: EventStream, callback: MatchListCallback) {
        while let Some(event) = feed.recv().await {
            if let RealtimeEvent::Change(_) = event {
                self.reload(&key, &user, &callback).await;
            }
        }
        debug!(key = %key, "Match feed closed");
    }

    async fn reload(&self, key: &str, user: &UserId, callback: &MatchListCallback) {
        match self.active_matches(user).await {
            Ok(list) => {
                deliver(key, callback, list);
            }
            Err(e) => warn!(key, error = %e, "Failed to load matches"),
        }
    }
}
