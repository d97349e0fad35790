//! Enqueue manager: the ticketed admission protocol.
//!
//! An enqueue attempt flows through rate limits, moderation and mode checks,
//! provider validation and the disallow lists, and finally becomes a ticket
//! watching a pool-allocated payment address. Payment of at least the
//! computed cost within the ticket lifetime admits the entry to the queue;
//! otherwise the ticket expires. Every status transition is broadcast on the
//! ticket's own event.

pub mod pricer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marquee_core::amount::Amount;
use marquee_core::config::EnqueueConfig;
use marquee_core::db::unix_timestamp;
use marquee_core::event::{BufferingGuarantee, Event};
use marquee_core::ratelimit::KeyedRateLimiter;
use marquee_core::shutdown::ShutdownToken;
use marquee_core::user::{PermissionLevel, User};
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gatekeeper::{Gatekeeper, MediaEnqueuingMode};
use crate::media::{
    BeginEnqueueOutcome, ContinueEnqueueOutcome, EnqueueOutcome, EnqueueRequestFlags,
    MediaEnqueueRequest, MediaError, MediaProvider, MediaRequestInfo,
};
use crate::moderation::ModerationStore;
use crate::payment::{PaymentAccountPool, PaymentError};
use crate::points::{tx_extra, PointsError, PointsManager};
use crate::queue::{EnqueuePlacement, MediaQueue};
use crate::storage::{Database, DatabaseError, PointsTxType};

/// How long terminal tickets stay resolvable for monitors.
const TICKET_RETENTION: Duration = Duration::from_secs(10 * 60);

/// Errors from the enqueue subsystem.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("no media provider found for request")]
    NoProvider,

    #[error("ticket not found: {0}")]
    TicketNotFound(String),

    #[error("insufficient permissions")]
    InsufficientPermissions,

    #[error("media enqueuing does not currently require a password")]
    PasswordNotRequired,

    #[error("rate limit reached")]
    RateLimited,

    #[error("incorrect password")]
    IncorrectPassword,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Points(#[from] PointsError),

    #[error(transparent)]
    Payment(#[from] PaymentError),
}

/// Status of an enqueue ticket. Transitions are terminal: Active → one of
/// {Paid, Expired, Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Active,
    Paid,
    Expired,
    Failed,
}

struct TicketState {
    status: TicketStatus,
    placement: EnqueuePlacement,
    collected: Amount,
}

/// A transient admission record for one enqueue attempt pending payment.
pub struct EnqueueTicket {
    id: String,
    request: MediaEnqueueRequest,
    payment_address: String,
    created_at: i64,
    state: Mutex<TicketState>,
    status_changed: Event<TicketStatus>,
    force_enqueue: Notify,
}

impl EnqueueTicket {
    fn new(request: MediaEnqueueRequest, payment_address: String) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            request,
            payment_address,
            created_at: unix_timestamp(),
            state: Mutex::new(TicketState {
                status: TicketStatus::Active,
                placement: EnqueuePlacement::Later,
                collected: Amount::zero(),
            }),
            status_changed: Event::new(),
            force_enqueue: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payment_address(&self) -> &str {
        &self.payment_address
    }

    pub fn request_cost(&self) -> Amount {
        self.request.request_cost
    }

    pub fn requested_by(&self) -> &User {
        &self.request.requested_by
    }

    pub const fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn status(&self) -> TicketStatus {
        self.state.lock().expect("ticket state poisoned").status
    }

    pub fn collected(&self) -> Amount {
        self.state.lock().expect("ticket state poisoned").collected
    }

    /// Fired on every status transition with the new status.
    pub fn status_changed(&self) -> &Event<TicketStatus> {
        &self.status_changed
    }

    /// Single terminal transition; returns false once settled.
    fn transition(&self, to: TicketStatus) -> bool {
        {
            let mut state = self.state.lock().expect("ticket state poisoned");
            if state.status != TicketStatus::Active || to == TicketStatus::Active {
                return false;
            }
            state.status = to;
        }
        self.status_changed.notify(to);
        true
    }

    fn add_collected(&self, amount: Amount) -> Amount {
        let mut state = self.state.lock().expect("ticket state poisoned");
        state.collected += amount;
        state.collected
    }

    fn placement(&self) -> EnqueuePlacement {
        self.state.lock().expect("ticket state poisoned").placement
    }

    fn set_placement(&self, placement: EnqueuePlacement) {
        self.state.lock().expect("ticket state poisoned").placement = placement;
    }
}

/// Context of the remote caller, as established by the transport layer.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub remote_address: String,
    pub user: Option<User>,
}

/// Parameters of one enqueue attempt.
#[derive(Debug, Clone)]
pub struct EnqueueMediaParams {
    pub info: MediaRequestInfo,
    pub unskippable: bool,
    pub concealed: bool,
    pub anonymous: bool,
    pub password: Option<String>,
}

/// Outcome of an enqueue attempt: a ticket, or a user-facing refusal.
pub enum EnqueueMediaResult {
    Ticket(Arc<EnqueueTicket>),
    Failure { reason: String },
}

impl EnqueueMediaResult {
    fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }
}

const MSG_ENQUEUING_DISABLED: &str =
    "Media enqueuing is currently disabled due to upcoming maintenance";
const MSG_STAFF_ONLY: &str = "At this moment, only Marquee staff can enqueue media";
const MSG_PASSWORD_REQUIRED: &str = "At this moment, a password is required for enqueuing";
const MSG_INCORRECT_PASSWORD: &str = "Incorrect password";
const MSG_RATE_LIMIT: &str = "Rate limit reached";
const MSG_ANONYMOUS_STAFF_ONLY: &str =
    "Only Marquee staff members can enqueue media anonymously";
const MSG_ANONYMOUS_CONCEALED: &str =
    "Anonymous users can not enqueue entries with hidden media information";
const MSG_CONCEALED_INSUFFICIENT_POINTS: &str =
    "Insufficient points to enqueue with hidden media information";
const MSG_PAYMENT_UNAVAILABLE: &str = "The Marquee payment subsystem is unavailable";

/// The enqueue manager.
pub struct EnqueueManager {
    config: EnqueueConfig,
    db: Database,
    queue: Arc<MediaQueue>,
    points: Arc<PointsManager>,
    payment_pool: Arc<dyn PaymentAccountPool>,
    moderation: Arc<dyn ModerationStore>,
    gatekeeper: Arc<Gatekeeper>,
    providers: Vec<Arc<dyn MediaProvider>>,
    short_term_limiter: KeyedRateLimiter,
    long_term_limiter: KeyedRateLimiter,
    password_limiter: KeyedRateLimiter,
    tickets: Mutex<HashMap<String, Arc<EnqueueTicket>>>,
    shutdown: ShutdownToken,
}

impl EnqueueManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EnqueueConfig,
        db: Database,
        queue: Arc<MediaQueue>,
        points: Arc<PointsManager>,
        payment_pool: Arc<dyn PaymentAccountPool>,
        moderation: Arc<dyn ModerationStore>,
        gatekeeper: Arc<Gatekeeper>,
        providers: Vec<Arc<dyn MediaProvider>>,
        shutdown: ShutdownToken,
    ) -> Arc<Self> {
        let short_term_limiter = KeyedRateLimiter::new(
            config.short_term_burst,
            Duration::from_secs(config.short_term_period_secs),
            config.short_term_burst,
        );
        let long_term_limiter = KeyedRateLimiter::new(
            config.long_term_burst,
            Duration::from_secs(config.long_term_period_secs),
            config.long_term_burst,
        );
        let password_limiter = KeyedRateLimiter::new(
            config.password_attempt_burst,
            Duration::from_secs(3600),
            config.password_attempt_burst,
        );
        Arc::new(Self {
            config,
            db,
            queue,
            points,
            payment_pool,
            moderation,
            gatekeeper,
            providers,
            short_term_limiter,
            long_term_limiter,
            password_limiter,
            tickets: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn get_ticket(&self, id: &str) -> Option<Arc<EnqueueTicket>> {
        self.tickets.lock().expect("ticket map poisoned").get(id).cloned()
    }

    /// Standalone password probe, rate-limited per remote address like the
    /// in-protocol check. Returns the current password edition on success.
    pub fn check_media_enqueuing_password(
        &self,
        remote_address: &str,
        password: &str,
    ) -> Result<String, EnqueueError> {
        if self.gatekeeper.mode() != MediaEnqueuingMode::PasswordRequired {
            return Err(EnqueueError::PasswordNotRequired);
        }
        if !self.password_limiter.take(remote_address) {
            return Err(EnqueueError::RateLimited);
        }
        if !self.gatekeeper.check_password(password) {
            return Err(EnqueueError::IncorrectPassword);
        }
        self.password_limiter.restore(remote_address, 1);
        Ok(self.gatekeeper.password_edition())
    }

    /// Preliminary check for enqueuing with hidden media information.
    pub async fn user_has_enough_points_for_concealed_entry(
        &self,
        user: &User,
    ) -> Result<bool, EnqueueError> {
        let balance = self.points.balance(user.address()).await?;
        Ok(balance >= self.config.concealed_entry_points_cost)
    }

    /// The full enqueue protocol. Refusals the user can act on come back as
    /// [`EnqueueMediaResult::Failure`]; system errors are `Err`.
    pub async fn enqueue_media(
        self: &Arc<Self>,
        ctx: &RequestContext,
        params: EnqueueMediaParams,
    ) -> Result<EnqueueMediaResult, EnqueueError> {
        if self
            .moderation
            .remote_address_banned_from_enqueuing(&ctx.remote_address)
            .await
        {
            return Ok(EnqueueMediaResult::failure(MSG_ENQUEUING_DISABLED));
        }

        let user = ctx.user.clone().unwrap_or_else(User::unknown);
        let is_staff = user.permission_level_is_at_least(PermissionLevel::Moderator);
        if !user.is_unknown()
            && self
                .moderation
                .address_banned_from_enqueuing(user.address())
                .await
        {
            return Ok(EnqueueMediaResult::failure(MSG_ENQUEUING_DISABLED));
        }

        let mode = self.gatekeeper.mode();
        match mode {
            MediaEnqueuingMode::Disabled => {
                return Ok(EnqueueMediaResult::failure(MSG_ENQUEUING_DISABLED));
            }
            MediaEnqueuingMode::StaffOnly if !is_staff => {
                return Ok(EnqueueMediaResult::failure(MSG_STAFF_ONLY));
            }
            MediaEnqueuingMode::PasswordRequired if !is_staff => {
                let Some(password) = params.password.as_deref().filter(|p| !p.is_empty()) else {
                    return Ok(EnqueueMediaResult::failure(MSG_PASSWORD_REQUIRED));
                };
                if !self.password_limiter.take(&ctx.remote_address) {
                    return Ok(EnqueueMediaResult::failure(MSG_RATE_LIMIT));
                }
                if !self.gatekeeper.check_password(password) {
                    return Ok(EnqueueMediaResult::failure(MSG_INCORRECT_PASSWORD));
                }
                self.password_limiter.restore(&ctx.remote_address, 1);
            }
            _ => {}
        }

        if params.anonymous && !is_staff {
            return Ok(EnqueueMediaResult::failure(MSG_ANONYMOUS_STAFF_ONLY));
        }

        if mode != MediaEnqueuingMode::StaffOnly {
            let long_ok = self.long_term_limiter.take(&ctx.remote_address);
            let short_ok = self.short_term_limiter.take(&ctx.remote_address);
            if !long_ok || !short_ok {
                return Ok(EnqueueMediaResult::failure(MSG_RATE_LIMIT));
            }
        }

        if params.concealed && !params.anonymous {
            if user.is_unknown() {
                return Ok(EnqueueMediaResult::failure(MSG_ANONYMOUS_CONCEALED));
            }
            if !self.user_has_enough_points_for_concealed_entry(&user).await? {
                return Ok(EnqueueMediaResult::failure(
                    MSG_CONCEALED_INSUFFICIENT_POINTS,
                ));
            }
        }

        let provider = self
            .providers
            .iter()
            .find(|p| p.can_handle_request_type(&params.info))
            .ok_or(EnqueueError::NoProvider)?;

        let pre_info = match provider.begin_enqueue_request(&params.info).await? {
            BeginEnqueueOutcome::Refused(outcome) => {
                return Ok(EnqueueMediaResult::failure(outcome.user_message()));
            }
            BeginEnqueueOutcome::Ready(pre_info) => pre_info,
        };

        let media = pre_info.media();
        if !self
            .db
            .is_media_allowed(&media.media_type, &media.media_id)
            .await?
        {
            return Ok(EnqueueMediaResult::failure(
                EnqueueOutcome::Disallowed.user_message(),
            ));
        }
        for collection in pre_info.collections() {
            if !self
                .db
                .is_media_collection_allowed(&collection.media_type, &collection.media_id)
                .await?
            {
                return Ok(EnqueueMediaResult::failure(
                    EnqueueOutcome::Disallowed.user_message(),
                ));
            }
        }

        let requested_by = if params.anonymous {
            User::unknown()
        } else {
            user
        };
        let staff_only = mode == MediaEnqueuingMode::StaffOnly;
        let flags = EnqueueRequestFlags {
            unskippable: params.unskippable,
            concealed: params.concealed,
            anonymous: params.anonymous,
            skip_length_checks: staff_only,
            skip_duplication_checks: staff_only,
        };
        let request = match provider
            .continue_enqueue_request(pre_info, requested_by, flags)
            .await?
        {
            ContinueEnqueueOutcome::Refused(outcome) => {
                return Ok(EnqueueMediaResult::failure(outcome.user_message()));
            }
            ContinueEnqueueOutcome::Ready(request) => request,
        };

        match self.register_request(request).await {
            Ok(ticket) => Ok(EnqueueMediaResult::Ticket(ticket)),
            Err(EnqueueError::Payment(e)) => {
                warn!(error = %e, "Payment account allocation failed");
                Ok(EnqueueMediaResult::failure(MSG_PAYMENT_UNAVAILABLE))
            }
            Err(e) => Err(e),
        }
    }

    /// Allocate a payment address and create the Active ticket watching it.
    pub async fn register_request(
        self: &Arc<Self>,
        request: MediaEnqueueRequest,
    ) -> Result<Arc<EnqueueTicket>, EnqueueError> {
        let receiver = self.payment_pool.receive_payment().await?;
        // Subscribe before the address can be shown to anyone so no payment
        // slips through unobserved.
        let payments = receiver
            .payment_received()
            .subscribe(BufferingGuarantee::BufferAll);

        let ticket = EnqueueTicket::new(request, receiver.address().to_string());
        self.tickets
            .lock()
            .expect("ticket map poisoned")
            .insert(ticket.id().to_string(), Arc::clone(&ticket));

        info!(
            ticket_id = ticket.id(),
            payment_address = ticket.payment_address(),
            cost = %ticket.request_cost(),
            "Enqueue ticket registered"
        );

        let manager = Arc::clone(self);
        let worker_ticket = Arc::clone(&ticket);
        tokio::spawn(async move {
            manager.ticket_worker(worker_ticket, payments).await;
        });

        Ok(ticket)
    }

    /// Moderation override: settle the ticket as paid without payment.
    pub fn forcibly_enqueue_ticket(
        &self,
        ticket_id: &str,
        placement: EnqueuePlacement,
        requester: &User,
    ) -> Result<(), EnqueueError> {
        if !requester.permission_level_is_at_least(PermissionLevel::Moderator) {
            return Err(EnqueueError::InsufficientPermissions);
        }
        let ticket = self
            .get_ticket(ticket_id)
            .ok_or_else(|| EnqueueError::TicketNotFound(ticket_id.to_string()))?;
        ticket.set_placement(placement);
        ticket.force_enqueue.notify_one();
        Ok(())
    }

    async fn ticket_worker(
        self: Arc<Self>,
        ticket: Arc<EnqueueTicket>,
        mut payments: marquee_core::event::EventSubscription<crate::payment::PaymentReceived>,
    ) {
        let lifetime = tokio::time::sleep(Duration::from_secs(self.config.ticket_lifetime_secs));
        tokio::pin!(lifetime);

        let outcome = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break TicketStatus::Failed,
                () = &mut lifetime => break TicketStatus::Expired,
                () = ticket.force_enqueue.notified() => break TicketStatus::Paid,
                payment = payments.recv() => {
                    match payment {
                        Some(payment) => {
                            let collected = ticket.add_collected(payment.amount);
                            if collected >= ticket.request_cost() {
                                break TicketStatus::Paid;
                            }
                        }
                        None => break TicketStatus::Failed,
                    }
                }
            }
        };

        let settled = match outcome {
            TicketStatus::Paid => self.admit_entry(&ticket).await,
            other => other,
        };
        if ticket.transition(settled) {
            info!(ticket_id = ticket.id(), status = ?settled, "Ticket settled");
        }

        tokio::select! {
            () = self.shutdown.cancelled() => {}
            () = tokio::time::sleep(TICKET_RETENTION) => {}
        }
        self.tickets
            .lock()
            .expect("ticket map poisoned")
            .remove(ticket.id());
    }

    /// Paid path: charge the concealment fee if applicable and append the
    /// produced entry to the queue.
    async fn admit_entry(&self, ticket: &EnqueueTicket) -> TicketStatus {
        let request = &ticket.request;
        if request.concealed && !request.requested_by.is_unknown() {
            let spend = self
                .points
                .create_transaction(
                    &request.requested_by,
                    PointsTxType::ConcealedEntryEnqueuing,
                    -self.config.concealed_entry_points_cost,
                    tx_extra([("ticket", ticket.id())]),
                )
                .await;
            match spend {
                Ok(_) => {}
                Err(PointsError::InsufficientBalance) => {
                    warn!(
                        ticket_id = ticket.id(),
                        "Concealment fee no longer covered; failing ticket"
                    );
                    return TicketStatus::Failed;
                }
                Err(e) => {
                    warn!(ticket_id = ticket.id(), error = %e, "Concealment fee charge failed");
                    return TicketStatus::Failed;
                }
            }
        }

        let entry = request.produce_queue_entry(Uuid::new_v4().to_string());
        match ticket.placement() {
            EnqueuePlacement::Later => self.queue.enqueue(entry),
            placement => self.queue.insert_with_placement(entry, placement),
        }
        TicketStatus::Paid
    }
}
