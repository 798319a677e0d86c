use crate::archive::{ArchiveBuilder, ArchiveError, ArchiveScope};
use crate::counter_store::CounterStore;
use crate::intake::{IntakePipeline, Outcome, RejectReason};
use crate::storage_layout::UserId;
use crate::telegram::{BotApi, Message, Update};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Bot commands understood by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Status,
    Download,
    DownloadAll,
}

impl Command {
    /// Parse `/cmd` or `/cmd@botname`, ignoring arguments
    pub fn parse(text: &str) -> Option<Self> {
        let token = text.split_whitespace().next()?;
        let name = token.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);

        match name {
            "start" => Some(Command::Start),
            "status" => Some(Command::Status),
            "download" => Some(Command::Download),
            "download_all" => Some(Command::DownloadAll),
            _ => None,
        }
    }
}

/// Translates Telegram updates into intake, status and archive calls and
/// sends the resulting replies.
pub struct EventAdapter {
    bot: Arc<dyn BotApi>,
    intake: Arc<IntakePipeline>,
    counters: Arc<CounterStore>,
    archives: ArchiveBuilder,
    privileged_user: Option<UserId>,
}

impl EventAdapter {
    pub fn new(
        bot: Arc<dyn BotApi>,
        intake: Arc<IntakePipeline>,
        counters: Arc<CounterStore>,
        archives: ArchiveBuilder,
        privileged_user: Option<UserId>,
    ) -> Self {
        Self {
            bot,
            intake,
            counters,
            archives,
            privileged_user,
        }
    }

    /// Handle one update end to end
    #[instrument(skip(self, update), fields(update_id = update.update_id))]
    pub async fn dispatch(&self, update: Update) {
        let Some(message) = update.message else {
            debug!("Ignoring update without message");
            return;
        };
        let Some(user_id) = message.from.as_ref().map(|user| UserId(user.id)) else {
            debug!("Ignoring message without sender");
            return;
        };
        let chat_id = message.chat.id;

        let reply = if !message.photo.is_empty() {
            Some(self.on_photo(user_id, &message).await)
        } else if let Some(command) = message.text.as_deref().and_then(Command::parse) {
            self.on_command(user_id, chat_id, command).await
        } else {
            debug!(user_id = %user_id, "Ignoring unsupported message");
            None
        };

        if let Some(text) = reply {
            if let Err(e) = self.bot.send_message(chat_id, &text).await {
                warn!(user_id = %user_id, error = %e, "Failed to send reply");
            }
        }
    }

    async fn on_photo(&self, user_id: UserId, message: &Message) -> String {
        // Telegram lists sizes smallest first.
        let Some(photo) = message.photo.last() else {
            return replies::DOWNLOAD_FAILED.to_string();
        };

        let raw_bytes = match self.bot.download_file(&photo.file_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to download photo");
                return replies::DOWNLOAD_FAILED.to_string();
            }
        };

        let outcome = self.intake.handle_photo(user_id, raw_bytes).await;
        replies::for_outcome(outcome, self.intake.photo_limit())
    }

    async fn on_command(&self, user_id: UserId, chat_id: i64, command: Command) -> Option<String> {
        let limit = self.intake.photo_limit();

        match command {
            Command::Start => {
                // Creates the quota record for this user.
                if let Err(e) = self.counters.get(user_id).await {
                    warn!(user_id = %user_id, error = %e, "Failed to load counter on start");
                }
                Some(replies::greeting(limit))
            }
            Command::Status => match self.counters.get(user_id).await {
                Ok(count) => Some(replies::status(count, limit)),
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "Failed to load counter");
                    Some(replies::STORAGE_FAULT.to_string())
                }
            },
            Command::Download => {
                self.send_archive(chat_id, ArchiveScope::User(user_id)).await
            }
            Command::DownloadAll => {
                // Only into the privileged user's own private chat, whose id
                // equals the user id, so no group member sees the archive.
                if self.privileged_user != Some(user_id) || chat_id != user_id.0 {
                    info!(user_id = %user_id, chat_id = chat_id, "Refused all-users archive");
                    return Some(replies::ACCESS_DENIED.to_string());
                }
                self.send_archive(chat_id, ArchiveScope::AllUsers).await
            }
        }
    }

    /// Build and send an archive; returns a text reply only on failure
    async fn send_archive(&self, chat_id: i64, scope: ArchiveScope) -> Option<String> {
        let report = match self.archives.build(scope).await {
            Ok(stream) => stream.into_zip().await,
            Err(e) => Err(e),
        };

        let report = match report {
            Ok(report) => report,
            Err(ArchiveError::Empty) => return Some(replies::NOTHING_STORED.to_string()),
            Err(e) => {
                error!(scope = ?scope, error = %e, "Failed to build archive");
                return Some(replies::ARCHIVE_FAILED.to_string());
            }
        };

        let caption = report
            .is_partial()
            .then(|| replies::partial(report.skipped, report.skipped_users));
        match self
            .bot
            .send_document(chat_id, &report.file_name, report.bytes, caption)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                warn!(scope = ?scope, error = %e, "Failed to send archive");
                Some(replies::ARCHIVE_FAILED.to_string())
            }
        }
    }
}

/// User-facing texts
pub mod replies {
    use super::{Outcome, RejectReason};

    pub const STORAGE_FAULT: &str = "❌ Could not save the photo right now. Please try again later.";
    pub const TRANSFORM_FAILED: &str =
        "❌ Could not process this photo. Please try again or send a different one.";
    pub const DOWNLOAD_FAILED: &str = "❌ Could not fetch the photo from Telegram. Please try again.";
    pub const ACCESS_DENIED: &str = "⛔ This command is not available to you.";
    pub const NOTHING_STORED: &str = "📭 No photos uploaded yet.";
    pub const ARCHIVE_FAILED: &str = "❌ Could not build the archive. Please try again later.";

    pub fn greeting(limit: u32) -> String {
        format!(
            "🎉 Hi! Upload your party photos here. Up to {} photos per guest.",
            limit
        )
    }

    pub fn status(count: u32, limit: u32) -> String {
        format!(
            "📸 {}/{} photos uploaded, {} left.",
            count,
            limit,
            limit.saturating_sub(count)
        )
    }

    pub fn limit_reached(limit: u32) -> String {
        format!("⚠️ The limit of {} photos has been reached!", limit)
    }

    pub fn partial(skipped: usize, skipped_users: usize) -> String {
        if skipped_users == 0 {
            format!("⚠️ {} photo(s) could not be read and were left out.", skipped)
        } else {
            format!(
                "⚠️ {} photo(s) and the folders of {} guest(s) could not be read and were left out.",
                skipped, skipped_users
            )
        }
    }

    pub fn for_outcome(outcome: Outcome, limit: u32) -> String {
        match outcome {
            // The count, not the sequence number: numbering may skip gaps.
            Outcome::Accepted { remaining, .. } => {
                format!("✅ Photo saved! ({}/{})", limit.saturating_sub(remaining), limit)
            }
            Outcome::Rejected { reason } => match reason {
                RejectReason::LimitReached => limit_reached(limit),
                RejectReason::TransformFailed => TRANSFORM_FAILED.to_string(),
                RejectReason::StorageFault | RejectReason::Internal => STORAGE_FAULT.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_layout::StorageLayout;
    use crate::telegram::{Chat, MockBotApi, PhotoSize, User};
    use crate::transform::MockPhotoTransform;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    const ADMIN: i64 = 1;
    const GUEST: i64 = 2;

    struct Fixture {
        _root: TempDir,
        layout: StorageLayout,
        counters: Arc<CounterStore>,
        intake: Arc<IntakePipeline>,
    }

    impl Fixture {
        fn new(limit: u32) -> Self {
            let root = TempDir::new().unwrap();
            let layout = StorageLayout::new(root.path());
            let counters = Arc::new(CounterStore::new(layout.clone()));
            let mut transform = MockPhotoTransform::new();
            transform.expect_apply().returning(|raw| Ok(raw.to_vec()));
            let intake = Arc::new(IntakePipeline::new(
                layout.clone(),
                counters.clone(),
                Arc::new(transform),
                limit,
                Duration::from_secs(5),
            ));
            Self {
                _root: root,
                layout,
                counters,
                intake,
            }
        }

        fn adapter(&self, bot: MockBotApi) -> EventAdapter {
            EventAdapter::new(
                Arc::new(bot),
                self.intake.clone(),
                self.counters.clone(),
                ArchiveBuilder::new(self.layout.clone()),
                Some(UserId(ADMIN)),
            )
        }
    }

    fn text_update(from: i64, text: &str) -> Update {
        Update {
            update_id: 1,
            message: Some(Message {
                message_id: 1,
                chat: Chat { id: from },
                from: Some(User {
                    id: from,
                    username: None,
                }),
                text: Some(text.to_string()),
                photo: vec![],
            }),
        }
    }

    fn photo_update(from: i64) -> Update {
        let mut update = text_update(from, "");
        if let Some(message) = update.message.as_mut() {
            message.text = None;
            message.photo = vec![
                PhotoSize {
                    file_id: "thumb".to_string(),
                    width: 90,
                    height: 90,
                    file_size: None,
                },
                PhotoSize {
                    file_id: "full".to_string(),
                    width: 1280,
                    height: 1280,
                    file_size: Some(1000),
                },
            ];
        }
        update
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/status please"), Some(Command::Status));
        assert_eq!(Command::parse("/download@party_bot"), Some(Command::Download));
        assert_eq!(Command::parse("/download_all"), Some(Command::DownloadAll));
        assert_eq!(Command::parse("download"), None);
        assert_eq!(Command::parse("/unknown"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn test_outcome_replies() {
        assert_eq!(
            replies::for_outcome(
                Outcome::Accepted {
                    sequence_number: 3,
                    remaining: 12
                },
                15
            ),
            "✅ Photo saved! (3/15)"
        );
        assert_eq!(
            replies::for_outcome(
                Outcome::Accepted {
                    sequence_number: 5,
                    remaining: 11
                },
                15
            ),
            "✅ Photo saved! (4/15)"
        );
        assert!(replies::for_outcome(
            Outcome::Rejected {
                reason: RejectReason::LimitReached
            },
            15
        )
        .contains("15"));
        assert!(replies::for_outcome(
            Outcome::Rejected {
                reason: RejectReason::StorageFault
            },
            15
        )
        .contains("try again"));
    }

    #[tokio::test]
    async fn test_photo_uses_largest_size_and_replies() {
        let fixture = Fixture::new(15);
        let mut bot = MockBotApi::new();
        bot.expect_download_file()
            .withf(|file_id| file_id == "full")
            .times(1)
            .returning(|_| Ok(vec![1, 2, 3]));
        bot.expect_send_message()
            .withf(|chat, text| *chat == GUEST && text == "✅ Photo saved! (1/15)")
            .times(1)
            .returning(|_, _| Ok(()));

        fixture.adapter(bot).dispatch(photo_update(GUEST)).await;

        assert_eq!(fixture.counters.get(UserId(GUEST)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_download_changes_nothing() {
        let fixture = Fixture::new(15);
        let mut bot = MockBotApi::new();
        bot.expect_download_file()
            .returning(|_| Err(crate::telegram::BotApiError::Api("gone".to_string())));
        bot.expect_send_message()
            .withf(|_, text| text == replies::DOWNLOAD_FAILED)
            .times(1)
            .returning(|_, _| Ok(()));

        fixture.adapter(bot).dispatch(photo_update(GUEST)).await;

        assert_eq!(fixture.counters.get(UserId(GUEST)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_limit_reached_reply() {
        let fixture = Fixture::new(1);
        fixture.intake.handle_photo(UserId(GUEST), vec![1]).await;

        let mut bot = MockBotApi::new();
        bot.expect_download_file().returning(|_| Ok(vec![2]));
        bot.expect_send_message()
            .withf(|_, text| text == replies::limit_reached(1))
            .times(1)
            .returning(|_, _| Ok(()));

        fixture.adapter(bot).dispatch(photo_update(GUEST)).await;
        assert_eq!(fixture.counters.get(UserId(GUEST)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_reports_count() {
        let fixture = Fixture::new(15);
        fixture.intake.handle_photo(UserId(GUEST), vec![1]).await;
        fixture.intake.handle_photo(UserId(GUEST), vec![2]).await;

        let mut bot = MockBotApi::new();
        bot.expect_send_message()
            .withf(|_, text| text == replies::status(2, 15))
            .times(1)
            .returning(|_, _| Ok(()));

        fixture.adapter(bot).dispatch(text_update(GUEST, "/status")).await;
    }

    #[tokio::test]
    async fn test_start_creates_record() {
        let fixture = Fixture::new(15);
        let mut bot = MockBotApi::new();
        bot.expect_send_message()
            .withf(|_, text| text == replies::greeting(15))
            .times(1)
            .returning(|_, _| Ok(()));

        fixture.adapter(bot).dispatch(text_update(GUEST, "/start")).await;
        assert_eq!(fixture.counters.known_users(), 1);
    }

    #[tokio::test]
    async fn test_download_all_denied_for_guest() {
        let fixture = Fixture::new(15);
        fixture.intake.handle_photo(UserId(ADMIN), vec![1]).await;

        let mut bot = MockBotApi::new();
        bot.expect_send_document().times(0);
        bot.expect_send_message()
            .withf(|_, text| text == replies::ACCESS_DENIED)
            .times(1)
            .returning(|_, _| Ok(()));

        fixture
            .adapter(bot)
            .dispatch(text_update(GUEST, "/download_all"))
            .await;
    }

    #[tokio::test]
    async fn test_download_all_refused_outside_private_chat() {
        let fixture = Fixture::new(15);
        fixture.intake.handle_photo(UserId(GUEST), vec![2]).await;

        let mut update = text_update(ADMIN, "/download_all");
        if let Some(message) = update.message.as_mut() {
            message.chat.id = -100;
        }

        let mut bot = MockBotApi::new();
        bot.expect_send_document().times(0);
        bot.expect_send_message()
            .withf(|chat, text| *chat == -100 && text == replies::ACCESS_DENIED)
            .times(1)
            .returning(|_, _| Ok(()));

        fixture.adapter(bot).dispatch(update).await;
    }

    #[tokio::test]
    async fn test_download_all_for_privileged_user() {
        let fixture = Fixture::new(15);
        fixture.intake.handle_photo(UserId(ADMIN), vec![1]).await;
        fixture.intake.handle_photo(UserId(GUEST), vec![2]).await;
        fixture.intake.handle_photo(UserId(GUEST), vec![3]).await;

        let mut bot = MockBotApi::new();
        bot.expect_send_message().times(0);
        bot.expect_send_document()
            .withf(|chat, name, bytes, caption| {
                let archive = zip::ZipArchive::new(Cursor::new(bytes.clone())).unwrap();
                *chat == ADMIN
                    && name == "party_photos.zip"
                    && archive.len() == 3
                    && caption.is_none()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        fixture
            .adapter(bot)
            .dispatch(text_update(ADMIN, "/download_all"))
            .await;
    }

    #[tokio::test]
    async fn test_download_own_photos() {
        let fixture = Fixture::new(15);
        fixture.intake.handle_photo(UserId(GUEST), vec![2]).await;

        let mut bot = MockBotApi::new();
        bot.expect_send_document()
            .withf(|chat, name, _, _| *chat == GUEST && name == "photos_2.zip")
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        fixture.adapter(bot).dispatch(text_update(GUEST, "/download")).await;
    }

    #[tokio::test]
    async fn test_download_with_nothing_stored() {
        let fixture = Fixture::new(15);
        let mut bot = MockBotApi::new();
        bot.expect_send_document().times(0);
        bot.expect_send_message()
            .withf(|_, text| text == replies::NOTHING_STORED)
            .times(1)
            .returning(|_, _| Ok(()));

        fixture.adapter(bot).dispatch(text_update(GUEST, "/download")).await;
    }

    #[tokio::test]
    async fn test_plain_text_is_ignored() {
        let fixture = Fixture::new(15);
        let mut bot = MockBotApi::new();
        bot.expect_send_message().times(0);

        fixture.adapter(bot).dispatch(text_update(GUEST, "hello")).await;
        fixture
            .adapter(MockBotApi::new())
            .dispatch(Update {
                update_id: 2,
                message: None,
            })
            .await;
    }
}
