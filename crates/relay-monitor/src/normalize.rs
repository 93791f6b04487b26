use std::collections::HashMap;
use std::sync::Arc;

use relay_core::channel::{AccountHandle, ChannelAdapter};
use relay_core::event::ChannelEvent;

/// A channel event after normalization: display name resolved, channel
/// reply-fallback markup stripped, thread id extracted.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub event: ChannelEvent,
    pub sender_name: String,
    pub body: String,
    pub thread_id: Option<String>,
}

/// Resolves sender display names (cache, then profile lookup, then the raw
/// id) and cleans message bodies. Notice-style bot messages are dropped
/// here.
pub struct Normalizer {
    adapter: Arc<dyn ChannelAdapter>,
    names: HashMap<String, String>,
}

impl Normalizer {
    pub fn new(adapter: Arc<dyn ChannelAdapter>) -> Self {
        Self {
            adapter,
            names: HashMap::new(),
        }
    }

    pub async fn normalize(
        &mut self,
        handle: &AccountHandle,
        event: ChannelEvent,
    ) -> Option<NormalizedMessage> {
        if event.is_notice {
            return None;
        }

        let body = strip_reply_fallback(&event.body);
        if body.is_empty() && event.media.is_empty() {
            return None;
        }

        let sender_name = self.resolve_name(handle, &event.sender_id).await;
        let thread_id = event.thread_id.clone();
        Some(NormalizedMessage {
            sender_name,
            body,
            thread_id,
            event,
        })
    }

    async fn resolve_name(&mut self, handle: &AccountHandle, user_id: &str) -> String {
        if let Some(cached) = self.names.get(user_id) {
            return cached.clone();
        }
        let resolved = match self.adapter.display_name(handle, user_id).await {
            Ok(Some(name)) if !name.trim().is_empty() => name,
            Ok(_) => user_id.to_string(),
            Err(error) => {
                log::debug!("profile lookup failed for {user_id}: {error}");
                user_id.to_string()
            }
        };
        self.names.insert(user_id.to_string(), resolved.clone());
        resolved
    }
}

/// Strip the quoted reply-fallback block some channels prepend: leading
/// lines starting with "> " up to the first blank line.
pub fn strip_reply_fallback(body: &str) -> String {
    if !body.starts_with("> ") {
        return body.trim().to_string();
    }

    let mut lines = body.lines();
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
        if !line.starts_with('>') {
            // Not actually a fallback block; keep the original.
            return body.trim().to_string();
        }
    }
    lines.collect::<Vec<_>>().join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::channel::{DecryptOutcome, OutboundTarget, SendOpts, SyncBatch};
    use relay_core::error::CoreError;
    use relay_core::event::MediaAttachment;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct ProfileAdapter {
        lookups: AtomicU32,
    }

    #[async_trait]
    impl ChannelAdapter for ProfileAdapter {
        async fn start_account(&self, account_id: &str) -> Result<AccountHandle, CoreError> {
            Ok(AccountHandle {
                account_id: account_id.into(),
            })
        }

        async fn stop_account(&self, _handle: &AccountHandle) -> Result<(), CoreError> {
            Ok(())
        }

        async fn poll(
            &self,
            _handle: &AccountHandle,
            _cursor: Option<&str>,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<SyncBatch, CoreError> {
            Ok(SyncBatch::default())
        }

        async fn send_text(
            &self,
            _target: &OutboundTarget,
            _text: &str,
            _opts: &SendOpts,
        ) -> Result<String, CoreError> {
            Ok("$sent".into())
        }

        async fn send_media(
            &self,
            _target: &OutboundTarget,
            _media: &MediaAttachment,
            _opts: &SendOpts,
        ) -> Result<String, CoreError> {
            Ok("$sent".into())
        }

        async fn reauth(&self, _handle: &AccountHandle) -> Result<(), CoreError> {
            Ok(())
        }

        async fn display_name(
            &self,
            _handle: &AccountHandle,
            user_id: &str,
        ) -> Result<Option<String>, CoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if user_id == "@alice:example.org" {
                Ok(Some("Alice".into()))
            } else {
                Ok(None)
            }
        }
    }

    fn event(body: &str) -> ChannelEvent {
        ChannelEvent {
            channel_id: "matrix".into(),
            room_id: "!room:example.org".into(),
            thread_id: Some("$thread".into()),
            event_id: "$e1".into(),
            sender_id: "@alice:example.org".into(),
            body: body.into(),
            media: vec![],
            timestamp_ms: 0,
            is_own_message: false,
            encrypted: false,
            is_direct: true,
            is_notice: false,
        }
    }

    fn handle() -> AccountHandle {
        AccountHandle {
            account_id: "acct".into(),
        }
    }

    #[tokio::test]
    async fn resolves_and_caches_display_names() {
        let adapter = Arc::new(ProfileAdapter {
            lookups: AtomicU32::new(0),
        });
        let mut normalizer = Normalizer::new(adapter.clone());

        let first = normalizer.normalize(&handle(), event("hi")).await.unwrap();
        assert_eq!(first.sender_name, "Alice");
        let second = normalizer.normalize(&handle(), event("again")).await.unwrap();
        assert_eq!(second.sender_name, "Alice");
        assert_eq!(adapter.lookups.load(Ordering::SeqCst), 1, "cache hit");
    }

    #[tokio::test]
    async fn unknown_profiles_fall_back_to_raw_id() {
        let adapter = Arc::new(ProfileAdapter {
            lookups: AtomicU32::new(0),
        });
        let mut normalizer = Normalizer::new(adapter);
        let mut unknown = event("hi");
        unknown.sender_id = "@bob:example.org".into();

        let normalized = normalizer.normalize(&handle(), unknown).await.unwrap();
        assert_eq!(normalized.sender_name, "@bob:example.org");
    }

    #[tokio::test]
    async fn notices_are_dropped() {
        let adapter = Arc::new(ProfileAdapter {
            lookups: AtomicU32::new(0),
        });
        let mut normalizer = Normalizer::new(adapter);
        let mut notice = event("automated message");
        notice.is_notice = true;
        assert!(normalizer.normalize(&handle(), notice).await.is_none());
    }

    #[tokio::test]
    async fn empty_bodies_without_media_are_dropped() {
        let adapter = Arc::new(ProfileAdapter {
            lookups: AtomicU32::new(0),
        });
        let mut normalizer = Normalizer::new(adapter);
        assert!(normalizer.normalize(&handle(), event("   ")).await.is_none());
    }

    #[test]
    fn reply_fallback_is_stripped() {
        let body = "> <@bob:example.org> earlier message\n> second quoted line\n\nactual reply";
        assert_eq!(strip_reply_fallback(body), "actual reply");
    }

    #[test]
    fn plain_bodies_are_untouched() {
        assert_eq!(strip_reply_fallback("no quoting here"), "no quoting here");
    }

    #[test]
    fn pure_quote_block_yields_empty_body() {
        let body = "> just a quote with no reply";
        assert_eq!(strip_reply_fallback(body), "");
    }

    #[tokio::test]
    async fn thread_id_is_extracted() {
        let adapter = Arc::new(ProfileAdapter {
            lookups: AtomicU32::new(0),
        });
        let mut normalizer = Normalizer::new(adapter);
        let normalized = normalizer.normalize(&handle(), event("hello")).await.unwrap();
        assert_eq!(normalized.thread_id.as_deref(), Some("$thread"));
    }
}
