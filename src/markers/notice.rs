use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Success,
    Error,
}

/// A transient, user-visible message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct Notices {
    items: Vec<Notice>,
    duration: Duration,
}

impl Notices {
    pub fn new(duration: Duration) -> Self {
        Self {
            items: Vec::new(),
            duration,
        }
    }

    pub fn push(&mut self, kind: NoticeKind, message: impl Into<String>, now: Instant) {
        let message = message.into();
        match kind {
            NoticeKind::Error => log::warn!("notice: {message}"),
            _ => log::info!("notice: {message}"),
        }
        self.items.push(Notice {
            kind,
            message,
            expires_at: now + self.duration,
        });
    }

    pub fn expire(&mut self, now: Instant) {
        self.items.retain(|n| n.expires_at > now);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notice> {
        self.items.iter()
    }

    pub fn latest(&self) -> Option<&Notice> {
        self.items.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_expire() {
        let now = Instant::now();
        let mut notices = Notices::new(Duration::from_secs(4));
        notices.push(NoticeKind::Info, "hello", now);
        notices.push(NoticeKind::Error, "boom", now + Duration::from_secs(2));
        notices.expire(now + Duration::from_secs(4));
        assert_eq!(notices.iter().count(), 1);
        assert_eq!(notices.latest().unwrap().kind, NoticeKind::Error);
        notices.expire(now + Duration::from_secs(6));
        assert!(notices.latest().is_none());
    }
}
