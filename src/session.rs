use tower_sessions::Session;

use crate::{AppResult, error::ChatError, id::UserId, identity::Identity};

pub const USER_ID: &str = "user_id";
pub const DISPLAY_NAME: &str = "display_name";
pub const PHOTO_REF: &str = "photo_ref";
pub const IS_GUEST: &str = "is_guest";

/// Reads the identity the auth provider (or `/guest`) left in the session.
pub async fn identity(session: &Session) -> AppResult<Option<Identity>> {
    let Some(user_id) = session.get::<String>(USER_ID).await? else {
        return Ok(None);
    };
    let display_name = session
        .get::<String>(DISPLAY_NAME)
        .await?
        .unwrap_or_else(|| user_id.clone());

    Ok(Some(Identity {
        id: UserId::new(user_id),
        display_name,
        is_guest: session.get::<bool>(IS_GUEST).await?.unwrap_or(false),
        photo_ref: session.get::<String>(PHOTO_REF).await?,
    }))
}

pub async fn require_identity(session: &Session) -> AppResult<Identity> {
    identity(session)
        .await?
        .ok_or_else(|| ChatError::PermissionDenied("sign in or join as a guest".into()).into())
}

pub async fn remember(session: &Session, identity: &Identity) -> AppResult<()> {
    session.cycle_id().await?;
    session.insert(USER_ID, identity.id.as_str()).await?;
    session.insert(DISPLAY_NAME, &identity.display_name).await?;
    session.insert(IS_GUEST, identity.is_guest).await?;
    if let Some(photo_ref) = &identity.photo_ref {
        session.insert(PHOTO_REF, photo_ref).await?;
    }
    Ok(())
}
