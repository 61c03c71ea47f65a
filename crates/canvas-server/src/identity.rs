use axum::http::HeaderMap;
use canvas_sync::Presence;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USERNAME_HEADER: &str = "x-user-name";
pub const DISPLAY_NAME_HEADER: &str = "x-user-display-name";
pub const AVATAR_HEADER: &str = "x-user-avatar";
pub const COLOR_HEADER: &str = "x-user-color";

const DEFAULT_COLOR: &str = "#6366f1";

/// The authenticated caller, as forwarded by the auth proxy in front of the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub color: String,
}

impl CurrentUser {
    /// `None` for anonymous requests
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let id = header(USER_ID_HEADER)?;
        Some(Self {
            username: header(USERNAME_HEADER).unwrap_or_else(|| id.clone()),
            display_name: header(DISPLAY_NAME_HEADER),
            avatar_url: header(AVATAR_HEADER),
            color: header(COLOR_HEADER).unwrap_or_else(|| DEFAULT_COLOR.to_string()),
            id,
        })
    }

    pub fn require(headers: &HeaderMap) -> Result<Self, AppError> {
        Self::from_headers(headers)
            .ok_or_else(|| AppError::Forbidden("sign in to edit this project".to_string()))
    }

    /// Presence record for one of this user's connections
    pub fn presence(&self, connection_id: impl Into<String>) -> Presence {
        let mut presence = Presence::new(connection_id, self.username.clone(), self.color.clone());
        presence.user_id = Some(self.id.clone());
        presence.display_name = self.display_name.clone();
        presence.avatar_url = self.avatar_url.clone();
        presence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(CurrentUser::from_headers(&headers), None);
        assert!(CurrentUser::require(&headers).is_err());

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u1"));
        headers.insert(DISPLAY_NAME_HEADER, HeaderValue::from_static("Alice"));
        let user = CurrentUser::from_headers(&headers).unwrap();
        assert_eq!(user.username, "u1");
        assert_eq!(user.display_name.as_deref(), Some("Alice"));
        assert_eq!(user.color, DEFAULT_COLOR);

        let presence = user.presence("conn-1");
        assert_eq!(presence.id, "conn-1");
        assert_eq!(presence.user_id.as_deref(), Some("u1"));
        assert_eq!(presence.label(), "Alice");
    }
}
