//! Activity challenges: type drawing, validation and the per-spectator
//! watchdog.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use marquee_core::user::{PermissionLevel, User};
use rand::Rng;

use super::spectator::{ActivityChallenge, ActivityChallengeType, Spectator};
use super::{RewardsError, RewardsHandler};

/// Validates one challenge submission.
pub type ChallengeCheckFuture = Pin<Box<dyn Future<Output = Result<bool, RewardsError>> + Send>>;
pub type ChallengeCheckFunction =
    Arc<dyn Fn(ActivityChallenge, String) -> ChallengeCheckFuture + Send + Sync>;

/// Computes the time until a spectator's next activity challenge. Pure in
/// its inputs so tests can replace it with a fixed schedule.
pub type ChallengeIntervalFunction = Arc<dyn Fn(&User, bool) -> Duration + Send + Sync>;

/// A validated submission, delivered to the spectator's watchdog.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChallengeSubmission {
    pub correct: bool,
    pub challenge_type: ActivityChallengeType,
}

/// External CAPTCHA verification capability (segcha, turnstile).
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, challenge_type: ActivityChallengeType, response: &str)
        -> Result<bool, RewardsError>;
}

/// Accepts any non-empty response; the standalone default.
pub struct AcceptingCaptchaVerifier;

#[async_trait]
impl CaptchaVerifier for AcceptingCaptchaVerifier {
    async fn verify(
        &self,
        _challenge_type: ActivityChallengeType,
        response: &str,
    ) -> Result<bool, RewardsError> {
        Ok(!response.is_empty())
    }
}

/// The built-in checker set.
pub fn default_challenge_checkers(
    captcha: Arc<dyn CaptchaVerifier>,
) -> HashMap<ActivityChallengeType, ChallengeCheckFunction> {
    let mut checkers: HashMap<ActivityChallengeType, ChallengeCheckFunction> = HashMap::new();

    checkers.insert(
        ActivityChallengeType::Button,
        Arc::new(
            |_challenge: ActivityChallenge, response: String| -> ChallengeCheckFuture {
                Box::pin(async move { Ok(!response.is_empty()) })
            },
        ),
    );

    for hard in [ActivityChallengeType::Segcha, ActivityChallengeType::Turnstile] {
        let captcha = Arc::clone(&captcha);
        checkers.insert(
            hard,
            Arc::new(
                move |_challenge: ActivityChallenge, response: String| -> ChallengeCheckFuture {
                    let captcha = Arc::clone(&captcha);
                    Box::pin(async move { captcha.verify(hard, &response).await })
                },
            ),
        );
    }

    checkers.insert(
        ActivityChallengeType::Moderating,
        Arc::new(
            |_challenge: ActivityChallenge, response: String| -> ChallengeCheckFuture {
                Box::pin(async move { Ok(!response.is_empty()) })
            },
        ),
    );

    checkers
}

/// Default challenge cadence: spectators get an early first check, then
/// long intervals with jitter; staff are checked half as often.
pub fn default_challenge_interval() -> ChallengeIntervalFunction {
    Arc::new(|user, initial| {
        let mut rng = rand::thread_rng();
        let base = if initial {
            rng.gen_range(240..600)
        } else {
            rng.gen_range(1680..2520)
        };
        let secs = if user.permission_level_is_at_least(PermissionLevel::Moderator) {
            base * 2
        } else {
            base
        };
        Duration::from_secs(secs)
    })
}

/// Which challenge types to present, hardest first. Any record of failure,
/// or a stale hard challenge, escalates past the plain button.
pub(crate) fn draw_challenge_types(
    is_moderator: bool,
    legitimacy_failures: u32,
    hard_challenge_stale: bool,
) -> Vec<ActivityChallengeType> {
    let mut types = Vec::new();
    if is_moderator {
        types.push(ActivityChallengeType::Moderating);
    }
    if legitimacy_failures > 0 || hard_challenge_stale {
        types.push(ActivityChallengeType::Segcha);
        types.push(ActivityChallengeType::Turnstile);
    } else {
        types.push(ActivityChallengeType::Button);
    }
    types
}

/// Long-lived per-spectator task: sleeps until the next check is due, issues
/// a challenge and waits for its resolution. Exits when the spectator is
/// purged or the handler shuts down.
pub(crate) async fn spectator_activity_watchdog(
    handler: Arc<RewardsHandler>,
    spectator: Arc<Spectator>,
) {
    let cancel = spectator.watchdog.token();
    let shutdown = handler.shutdown_token();

    loop {
        let next = spectator
            .inner
            .lock()
            .expect("spectator poisoned")
            .next_activity_check;

        tokio::select! {
            () = cancel.cancelled() => return,
            () = shutdown.cancelled() => return,
            () = spectator.reschedule.notified() => continue,
            () = tokio::time::sleep_until(next) => {}
        }

        let Some((challenge, mut submissions)) = handler.issue_activity_challenge(&spectator)
        else {
            continue;
        };

        // Zero tolerance means the outcome is an immediate expiry; the
        // challenge stays answerable so legitimacy can be regained.
        let mut expired = challenge.tolerance.is_zero();
        if expired {
            handler.record_challenge_expiry(&spectator);
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    handler.clear_challenge(&spectator, &challenge);
                    return;
                }
                () = shutdown.cancelled() => return,
                submission = submissions.recv() => {
                    match submission {
                        Some(submission) => {
                            handler.apply_challenge_outcome(&spectator, &challenge, submission, expired);
                        }
                        None => handler.clear_challenge(&spectator, &challenge),
                    }
                    break;
                }
                () = tokio::time::sleep(challenge.tolerance), if !expired => {
                    handler.record_challenge_expiry(&spectator);
                    expired = true;
                }
            }
        }
    }
}
