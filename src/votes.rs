use crate::error::{ForumError, Lookup};
use crate::models::{Thread, Vote};
use crate::repo::{Unit, VoteRepo};
use crate::validate;

/// Record `vote` on the thread addressed by `slug_or_id` and return the thread with its new total.
///
/// A voter's earlier voice is replaced, so the total moves by the difference.
pub async fn set_vote(
    unit: &mut dyn Unit,
    slug_or_id: &str,
    vote: &Vote,
) -> Result<Thread, ForumError> {
    if vote.voice != 1 && vote.voice != -1 {
        return Err(ForumError::bad_request(format!("voice must be -1 or 1, got {}", vote.voice)));
    }
    let thread = validate::thread(unit, slug_or_id).await?;
    let voter = validate::user(unit, &vote.nickname, Lookup::User).await?;

    unit.lock_thread(thread.id).await?;
    let canonical = Vote { nickname: voter.nickname, voice: vote.voice };
    let previous = unit.upsert_vote(thread.id, &canonical).await?;
    let delta = i64::from(canonical.voice) - i64::from(previous.unwrap_or(0));
    let votes = unit.add_votes(thread.id, delta).await?;
    tracing::debug!(thread = thread.id, voter = %canonical.nickname, delta, votes, "vote recorded");

    Ok(Thread { votes, ..thread })
}
