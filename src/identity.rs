use tower_cookies::{Cookie, Cookies, cookie::SameSite, cookie::time::Duration};
use uuid::Uuid;

pub const ANON_ID_COOKIE: &str = "anon_id";

/// A voter. Authenticated users and anonymous clients live in disjoint
/// identity spaces and are never merged, even when their ids collide
/// textually.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParticipantKey {
    Authenticated(Uuid),
    Anonymous(String),
}

/// Durable client-scoped storage for the anonymous fingerprint.
pub trait FingerprintStore {
    fn load(&self) -> Option<String>;
    fn save(&self, fingerprint: &str);
}

/// Resolve the participant key for a request. Authenticated ids win; otherwise
/// the anonymous fingerprint is read-if-exists-else-create-and-persist, so
/// repeated calls for the same client yield the same key.
pub fn resolve(auth_user: Option<Uuid>, fingerprints: &impl FingerprintStore) -> ParticipantKey {
    if let Some(user_id) = auth_user {
        return ParticipantKey::Authenticated(user_id);
    }

    let fingerprint = match fingerprints.load() {
        Some(existing) => existing,
        None => {
            let fresh = Uuid::new_v4().to_string();
            fingerprints.save(&fresh);
            fresh
        }
    };

    ParticipantKey::Anonymous(fingerprint)
}

/// Fingerprint storage backed by the request cookie jar. The fingerprint is a
/// soft identity, not a security boundary.
pub struct CookieFingerprints<'a> {
    cookies: &'a Cookies,
}

impl<'a> CookieFingerprints<'a> {
    pub fn new(cookies: &'a Cookies) -> Self {
        Self { cookies }
    }
}

impl FingerprintStore for CookieFingerprints<'_> {
    fn load(&self) -> Option<String> {
        self.cookies
            .get(ANON_ID_COOKIE)
            .map(|cookie| cookie.value().to_string())
    }

    fn save(&self, fingerprint: &str) {
        let mut cookie = Cookie::new(ANON_ID_COOKIE, fingerprint.to_string());
        cookie.set_path("/");
        cookie.set_same_site(SameSite::Lax);
        cookie.set_max_age(Duration::days(365));
        self.cookies.add(cookie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct MemoryFingerprints(RefCell<Option<String>>);

    impl MemoryFingerprints {
        fn empty() -> Self {
            Self(RefCell::new(None))
        }
    }

    impl FingerprintStore for MemoryFingerprints {
        fn load(&self) -> Option<String> {
            self.0.borrow().clone()
        }

        fn save(&self, fingerprint: &str) {
            *self.0.borrow_mut() = Some(fingerprint.to_string());
        }
    }

    #[test]
    fn authenticated_id_wins_over_fingerprint() {
        let store = MemoryFingerprints::empty();
        store.save("abc");
        let user_id = Uuid::new_v4();

        let key = resolve(Some(user_id), &store);

        assert_eq!(key, ParticipantKey::Authenticated(user_id));
    }

    #[test]
    fn fingerprint_is_created_once_and_reused() {
        let store = MemoryFingerprints::empty();

        let first = resolve(None, &store);
        let second = resolve(None, &store);

        assert_eq!(first, second);
        match first {
            ParticipantKey::Anonymous(id) => assert_eq!(store.load(), Some(id)),
            other => panic!("expected anonymous key, got {other:?}"),
        }
    }

    #[test]
    fn identity_spaces_never_merge() {
        let user_id = Uuid::new_v4();
        let authenticated = ParticipantKey::Authenticated(user_id);
        let anonymous = ParticipantKey::Anonymous(user_id.to_string());

        assert_ne!(authenticated, anonymous);
    }
}
