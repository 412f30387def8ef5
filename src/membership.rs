use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::member::MemberId;

/// The engine's view of the membership service. The engine never maintains membership
///  state of its own - it asks, reports suspicions, and requests removals through this
///  seam, and the membership layer decides.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Membership: Send + Sync + 'static {
    fn member_exists(&self, member: &MemberId) -> bool;

    /// A shunned member has been forcibly excluded; connections from it are refused.
    fn is_shunned(&self, member: &MemberId) -> bool;

    fn shutdown_in_progress(&self) -> bool;

    /// Admit a member that connected before the membership view caught up with it.
    fn add_surprise_member(&self, member: MemberId);

    /// Report that a member looks unhealthy; the membership layer verifies and decides.
    async fn suspect_member(&self, member: MemberId, reason: String);

    /// Ask for a member to be removed from the view.
    async fn request_member_removal(&self, member: MemberId, reason: String);

    /// Secure-handshake gating: block until the member has cleared the membership check,
    ///  returning false on timeout.
    async fn wait_for_membership_check(&self, member: &MemberId) -> bool;
}
