use crate::clock::SharedClock;
use crate::database::models::{
    BoardRecord, BoardStatus, IdentType, NewPost, NewTopic, TopicMetaRecord, TopicRecord,
    TopicStatus,
};
use crate::database::Database;
use crate::database::repositories::{BoardRepository, PostRepository, TopicRepository};
use crate::error::{is_constraint_violation, Rejection, SubmissionError};
use crate::identity::IdentityService;
use crate::kv::KvResult;
use crate::pipeline::{ReplySubmission, TopicSubmission};
use chrono_tz::Tz;
use std::net::IpAddr;

/// Times a reply transaction is re-run after losing a post-number race
/// before the conflict is handed back to the caller.
pub const MAX_NUMBER_CONFLICT_RETRIES: u32 = 5;

/// New topics need an open board.
pub fn check_topic_creation(board: &BoardRecord) -> Result<(), Rejection> {
    if board.status != BoardStatus::Open {
        return Err(Rejection::StatusRejected {
            status: board.status.to_string(),
        });
    }
    Ok(())
}

/// Replies need an open topic on a board that is not archived.
pub fn check_reply(board: &BoardRecord, topic: &TopicRecord) -> Result<(), Rejection> {
    if topic.status != TopicStatus::Open {
        return Err(Rejection::StatusRejected {
            status: topic.status.to_string(),
        });
    }
    if board.status == BoardStatus::Archived {
        return Err(Rejection::StatusRejected {
            status: board.status.to_string(),
        });
    }
    Ok(())
}

/// Cap check applied when a topic is created with its first post.
pub fn caps_new_topic(post_count: i64, max_posts: u32) -> bool {
    post_count >= i64::from(max_posts)
}

/// Cap check applied after reply number `number`: the topic closes one post
/// before `max_posts`.
pub fn caps_reply(number: i64, max_posts: u32) -> bool {
    number >= i64::from(max_posts) - 1
}

/// Chooses the ident shown next to a post.
#[derive(Clone)]
pub struct IdentPolicy {
    identity: IdentityService,
    time_zone: Tz,
}

impl IdentPolicy {
    pub fn new(identity: IdentityService, time_zone: Tz) -> Self {
        Self {
            identity,
            time_zone,
        }
    }

    pub async fn ident_for(
        &self,
        board: &BoardRecord,
        ip_address: IpAddr,
    ) -> KvResult<(Option<String>, IdentType)> {
        if !board.settings.use_ident {
            return Ok((None, IdentType::None));
        }
        let ident_type = match ip_address {
            IpAddr::V4(_) => IdentType::Ident,
            IpAddr::V6(_) => IdentType::IdentV6,
        };
        let ip = ip_address.to_string();
        let ident = self
            .identity
            .identity_with_tz_for(
                self.time_zone,
                &[("board", board.slug.as_str()), ("ip_address", ip.as_str())],
            )
            .await?;
        Ok((Some(ident), ident_type))
    }
}

#[derive(Clone)]
pub struct TopicAppender {
    database: Database,
    idents: IdentPolicy,
    clock: SharedClock,
}

impl TopicAppender {
    pub fn new(database: Database, idents: IdentPolicy, clock: SharedClock) -> Self {
        Self {
            database,
            idents,
            clock,
        }
    }

    /// Creates the topic, its meta row and post 1 in one transaction and
    /// returns the topic id.
    pub async fn append(&self, input: &TopicSubmission) -> Result<i64, SubmissionError> {
        let board = self
            .database
            .with_repositories(|repos| repos.boards().get_by_slug(&input.board_slug))?
            .ok_or_else(|| SubmissionError::NotFound(format!("board {}", input.board_slug)))?;
        check_topic_creation(&board)?;
        let (ident, ident_type) = self.idents.ident_for(&board, input.ip_address).await?;
        let now = self.clock.now();

        let (topic_id, archived) = self.database.with_transaction(|repos| {
            let board = repos
                .boards()
                .get_by_slug(&input.board_slug)?
                .ok_or_else(|| SubmissionError::NotFound(format!("board {}", input.board_slug)))?;
            check_topic_creation(&board)?;

            let topic_id = repos.topics().create(&NewTopic {
                board_id: board.id,
                title: input.title.clone(),
                status: TopicStatus::Open,
                created_at: now,
            })?;
            let meta = TopicMetaRecord {
                topic_id,
                post_count: 1,
                posted_at: Some(now),
                bumped_at: Some(now),
            };
            repos.topics().create_meta(&meta)?;
            repos.posts().create(&NewPost {
                topic_id,
                number: 1,
                name: board.settings.name.clone(),
                body: input.body.clone(),
                bumped: true,
                ident,
                ident_type,
                ip_address: input.ip_address.to_string(),
                created_at: now,
            })?;

            let archived = caps_new_topic(meta.post_count, board.settings.max_posts);
            if archived {
                repos
                    .topics()
                    .set_status(topic_id, TopicStatus::Archived, now)?;
            }
            Ok::<_, SubmissionError>((topic_id, archived))
        })?;

        tracing::info!(
            topic_id,
            board = %input.board_slug,
            archived,
            "topic created"
        );
        Ok(topic_id)
    }
}

/// Reply written by a moderator under their own name and ident. It bypasses
/// admission and may land on locked topics and locked boards.
#[derive(Debug, Clone)]
pub struct ModeratorReply {
    pub topic_id: i64,
    pub body: String,
    pub bumped: bool,
    pub ip_address: IpAddr,
    pub name: String,
    pub ident: String,
}

/// Moderators may also write to locked topics. Archived and expired topics
/// and archived boards stay closed.
pub fn check_moderator_reply(board: &BoardRecord, topic: &TopicRecord) -> Result<(), Rejection> {
    if !matches!(topic.status, TopicStatus::Open | TopicStatus::Locked) {
        return Err(Rejection::StatusRejected {
            status: topic.status.to_string(),
        });
    }
    if board.status == BoardStatus::Archived {
        return Err(Rejection::StatusRejected {
            status: board.status.to_string(),
        });
    }
    Ok(())
}

type StatusGate = fn(&BoardRecord, &TopicRecord) -> Result<(), Rejection>;

/// Everything the reply transaction needs, whoever the author is.
struct ReplyDraft<'a> {
    topic_id: i64,
    body: &'a str,
    bumped: bool,
    ip_address: IpAddr,
    /// `None` posts under the board's default name.
    name: Option<&'a str>,
    ident: Option<String>,
    ident_type: IdentType,
    gate: StatusGate,
}

/// Re-runs `attempt` while it loses post-number races, at most
/// [`MAX_NUMBER_CONFLICT_RETRIES`] times in total.
fn retry_number_conflicts<T, F>(mut attempt: F) -> Result<T, SubmissionError>
where
    F: FnMut() -> Result<T, SubmissionError>,
{
    let mut tries = 1;
    loop {
        match attempt() {
            Err(SubmissionError::Conflict(topic_id)) if tries < MAX_NUMBER_CONFLICT_RETRIES => {
                tracing::warn!(topic_id, attempt = tries, "post number taken, retrying append");
                tries += 1;
            }
            other => return other,
        }
    }
}

#[derive(Clone)]
pub struct PostAppender {
    database: Database,
    idents: IdentPolicy,
    clock: SharedClock,
}

impl PostAppender {
    pub fn new(database: Database, idents: IdentPolicy, clock: SharedClock) -> Self {
        Self {
            database,
            idents,
            clock,
        }
    }

    /// Appends the reply under the next post number and returns the post id.
    pub async fn append(&self, input: &ReplySubmission) -> Result<i64, SubmissionError> {
        let (board, topic) = self.load_target(input.topic_id)?;
        check_reply(&board, &topic)?;
        let (ident, ident_type) = self.idents.ident_for(&board, input.ip_address).await?;
        self.append_draft(&ReplyDraft {
            topic_id: input.topic_id,
            body: &input.body,
            bumped: input.bumped,
            ip_address: input.ip_address,
            name: None,
            ident,
            ident_type,
            gate: check_reply,
        })
    }

    pub async fn append_as_moderator(&self, input: &ModeratorReply) -> Result<i64, SubmissionError> {
        let (board, topic) = self.load_target(input.topic_id)?;
        check_moderator_reply(&board, &topic)?;
        self.append_draft(&ReplyDraft {
            topic_id: input.topic_id,
            body: &input.body,
            bumped: input.bumped,
            ip_address: input.ip_address,
            name: Some(&input.name),
            ident: Some(input.ident.clone()),
            ident_type: IdentType::IdentAdmin,
            gate: check_moderator_reply,
        })
    }

    fn load_target(&self, topic_id: i64) -> Result<(BoardRecord, TopicRecord), SubmissionError> {
        self.database
            .with_repositories(|repos| {
                let topic = repos.topics().get(topic_id)?;
                let board = match &topic {
                    Some(topic) => repos.boards().get(topic.board_id)?,
                    None => None,
                };
                Ok(board.zip(topic))
            })?
            .ok_or_else(|| SubmissionError::NotFound(format!("topic {topic_id}")))
    }

    fn append_draft(&self, draft: &ReplyDraft<'_>) -> Result<i64, SubmissionError> {
        retry_number_conflicts(|| self.append_locked(draft))
    }

    fn append_locked(&self, draft: &ReplyDraft<'_>) -> Result<i64, SubmissionError> {
        let now = self.clock.now();
        let (post_id, number, archived) = self.database.with_transaction(|repos| {
            let topic = repos
                .topics()
                .get(draft.topic_id)?
                .ok_or_else(|| SubmissionError::NotFound(format!("topic {}", draft.topic_id)))?;
            let board = repos
                .boards()
                .get(topic.board_id)?
                .ok_or_else(|| SubmissionError::NotFound(format!("board {}", topic.board_id)))?;
            (draft.gate)(&board, &topic)?;

            let number = repos.posts().max_number(topic.id)? + 1;
            let name = match draft.name {
                Some(name) => name.to_string(),
                None => board.settings.name.clone(),
            };
            let post_id = repos
                .posts()
                .create(&NewPost {
                    topic_id: topic.id,
                    number,
                    name,
                    body: draft.body.to_string(),
                    bumped: draft.bumped,
                    ident: draft.ident.clone(),
                    ident_type: draft.ident_type,
                    ip_address: draft.ip_address.to_string(),
                    created_at: now,
                })
                .map_err(|err| {
                    if is_constraint_violation(&err) {
                        SubmissionError::Conflict(topic.id)
                    } else {
                        SubmissionError::Transient(err)
                    }
                })?;

            let mut meta = repos
                .topics()
                .get_meta(topic.id)?
                .unwrap_or(TopicMetaRecord {
                    topic_id: topic.id,
                    post_count: 0,
                    posted_at: None,
                    bumped_at: None,
                });
            meta.post_count = number;
            meta.posted_at = Some(now);
            if draft.bumped {
                meta.bumped_at = Some(now);
            }
            repos.topics().update_meta(&meta)?;

            // Only open topics roll over to archived.
            let archived =
                topic.status == TopicStatus::Open && caps_reply(number, board.settings.max_posts);
            if archived {
                repos
                    .topics()
                    .set_status(topic.id, TopicStatus::Archived, now)?;
            }
            Ok::<_, SubmissionError>((post_id, number, archived))
        })?;

        tracing::info!(
            post_id,
            topic_id = draft.topic_id,
            number,
            bumped = draft.bumped,
            ident_type = %draft.ident_type,
            archived,
            "reply appended"
        );
        Ok(post_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::database::models::{BoardSettings, NewBoard, PostQuery};
    use crate::identity::DEFAULT_IDENT_SIZE;
    use crate::kv::MemoryStore;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    struct Fixture {
        db: Database,
        clock: ManualClock,
        topics: TopicAppender,
        posts: PostAppender,
    }

    fn fixture() -> Fixture {
        fixture_with(Database::open_in_memory().expect("db"))
    }

    fn fixture_with(db: Database) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(shared.clone()));
        let idents = IdentPolicy::new(IdentityService::new(store, DEFAULT_IDENT_SIZE), Tz::UTC);
        Fixture {
            topics: TopicAppender::new(db.clone(), idents.clone(), shared.clone()),
            posts: PostAppender::new(db.clone(), idents, shared),
            db,
            clock,
        }
    }

    fn create_board(db: &Database, slug: &str, status: BoardStatus, settings: BoardSettings) {
        db.with_repositories(|repos| {
            repos.boards().create(&NewBoard {
                slug: slug.into(),
                title: slug.into(),
                description: None,
                status,
                settings,
                created_at: Utc::now(),
            })
        })
        .expect("create board");
    }

    fn topic_input(board: &str, ip: &str) -> TopicSubmission {
        TopicSubmission {
            board_slug: board.into(),
            title: "Hello".into(),
            body: "first".into(),
            ip_address: ip.parse().unwrap(),
            payload: Default::default(),
        }
    }

    fn reply_input(topic_id: i64, ip: &str, bumped: bool) -> ReplySubmission {
        ReplySubmission {
            topic_id,
            body: "reply".into(),
            bumped,
            ip_address: ip.parse().unwrap(),
            payload: Default::default(),
        }
    }

    fn meta(db: &Database, topic_id: i64) -> TopicMetaRecord {
        db.with_repositories(|repos| repos.topics().get_meta(topic_id))
            .unwrap()
            .expect("meta")
    }

    fn topic(db: &Database, topic_id: i64) -> TopicRecord {
        db.with_repositories(|repos| repos.topics().get(topic_id))
            .unwrap()
            .expect("topic")
    }

    #[tokio::test]
    async fn topic_creation_writes_first_post_and_meta() {
        let fx = fixture();
        create_board(&fx.db, "foo", BoardStatus::Open, BoardSettings::default());
        let topic_id = fx.topics.append(&topic_input("foo", "10.0.0.1")).await.unwrap();

        let posts = fx
            .db
            .with_repositories(|repos| repos.posts().list_for_topic(topic_id, PostQuery::All))
            .unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].number, 1);
        assert!(posts[0].bumped);
        assert_eq!(posts[0].name, "Nameless Fanboi");
        assert_eq!(posts[0].ident_type, IdentType::Ident);
        assert_eq!(posts[0].ident.as_deref().map(str::len), Some(10));

        let meta = meta(&fx.db, topic_id);
        assert_eq!(meta.post_count, 1);
        assert_eq!(meta.posted_at, Some(fx.clock.now()));
        assert_eq!(meta.bumped_at, Some(fx.clock.now()));
        assert_eq!(topic(&fx.db, topic_id).status, TopicStatus::Open);
    }

    #[tokio::test]
    async fn ident_follows_board_settings_and_address_family() {
        let fx = fixture();
        let no_ident = BoardSettings {
            use_ident: false,
            ..BoardSettings::default()
        };
        create_board(&fx.db, "anon", BoardStatus::Open, no_ident);
        create_board(&fx.db, "foo", BoardStatus::Open, BoardSettings::default());

        let anon = fx.topics.append(&topic_input("anon", "10.0.0.1")).await.unwrap();
        let v6 = fx.topics.append(&topic_input("foo", "2001:db8::1")).await.unwrap();
        let first = |topic_id| {
            fx.db
                .with_repositories(|repos| repos.posts().list_for_topic(topic_id, PostQuery::Single(1)))
                .unwrap()
                .remove(0)
        };
        let anon_post = first(anon);
        assert_eq!(anon_post.ident, None);
        assert_eq!(anon_post.ident_type, IdentType::None);
        assert_eq!(first(v6).ident_type, IdentType::IdentV6);
    }

    #[tokio::test]
    async fn same_poster_keeps_ident_within_a_board() {
        let fx = fixture();
        create_board(&fx.db, "foo", BoardStatus::Open, BoardSettings::default());
        let topic_id = fx.topics.append(&topic_input("foo", "10.0.0.1")).await.unwrap();
        fx.posts.append(&reply_input(topic_id, "10.0.0.1", true)).await.unwrap();
        fx.posts.append(&reply_input(topic_id, "10.0.0.2", true)).await.unwrap();

        let posts = fx
            .db
            .with_repositories(|repos| repos.posts().list_for_topic(topic_id, PostQuery::All))
            .unwrap();
        assert_eq!(posts[0].ident, posts[1].ident);
        assert_ne!(posts[0].ident, posts[2].ident);
    }

    #[tokio::test]
    async fn replies_number_densely_and_keep_counters() {
        let fx = fixture();
        create_board(&fx.db, "foo", BoardStatus::Open, BoardSettings::default());
        let topic_id = fx.topics.append(&topic_input("foo", "10.0.0.1")).await.unwrap();
        let created = fx.clock.now();

        fx.clock.advance(Duration::seconds(30));
        fx.posts.append(&reply_input(topic_id, "10.0.0.2", true)).await.unwrap();
        let bumped = fx.clock.now();

        fx.clock.advance(Duration::seconds(30));
        let sage_id = fx.posts.append(&reply_input(topic_id, "10.0.0.3", false)).await.unwrap();
        let sage_at = fx.clock.now();

        let posts = fx
            .db
            .with_repositories(|repos| repos.posts().list_for_topic(topic_id, PostQuery::All))
            .unwrap();
        let numbers: Vec<i64> = posts.iter().map(|post| post.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(posts[2].id, sage_id);
        assert!(!posts[2].bumped);

        let meta = meta(&fx.db, topic_id);
        let count = fx
            .db
            .with_repositories(|repos| repos.posts().count_for_topic(topic_id))
            .unwrap();
        assert_eq!(meta.post_count, count);
        assert_eq!(meta.posted_at, Some(sage_at));
        assert_eq!(meta.bumped_at, Some(bumped));
        assert!(meta.bumped_at > Some(created));
    }

    #[tokio::test]
    async fn reply_that_fills_the_cap_archives_the_topic() {
        let fx = fixture();
        let settings = BoardSettings {
            max_posts: 3,
            ..BoardSettings::default()
        };
        create_board(&fx.db, "foo", BoardStatus::Open, settings);
        let topic_id = fx.topics.append(&topic_input("foo", "10.0.0.1")).await.unwrap();
        assert_eq!(topic(&fx.db, topic_id).status, TopicStatus::Open);

        fx.posts.append(&reply_input(topic_id, "10.0.0.2", true)).await.unwrap();
        assert_eq!(topic(&fx.db, topic_id).status, TopicStatus::Archived);

        let err = fx
            .posts
            .append(&reply_input(topic_id, "10.0.0.3", true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubmissionError::Rejected(Rejection::StatusRejected { ref status }) if status == "archived"
        ));
        assert_eq!(meta(&fx.db, topic_id).post_count, 2);
    }

    #[tokio::test]
    async fn single_post_cap_archives_on_creation() {
        let fx = fixture();
        let settings = BoardSettings {
            max_posts: 1,
            ..BoardSettings::default()
        };
        create_board(&fx.db, "foo", BoardStatus::Open, settings);
        let topic_id = fx.topics.append(&topic_input("foo", "10.0.0.1")).await.unwrap();
        assert_eq!(topic(&fx.db, topic_id).status, TopicStatus::Archived);
    }

    #[tokio::test]
    async fn status_gate_guards_both_appenders() {
        let fx = fixture();
        create_board(&fx.db, "foo", BoardStatus::Open, BoardSettings::default());
        for status in [BoardStatus::Restricted, BoardStatus::Locked, BoardStatus::Archived] {
            let slug = status.as_str();
            create_board(&fx.db, slug, status, BoardSettings::default());
            let err = fx.topics.append(&topic_input(slug, "10.0.0.1")).await.unwrap_err();
            assert!(matches!(
                err,
                SubmissionError::Rejected(Rejection::StatusRejected { ref status }) if status == slug
            ));
        }

        let topic_id = fx.topics.append(&topic_input("foo", "10.0.0.1")).await.unwrap();
        fx.db
            .with_repositories(|repos| {
                repos.boards().set_status(1, BoardStatus::Locked)?;
                Ok(())
            })
            .unwrap();
        fx.posts
            .append(&reply_input(topic_id, "10.0.0.1", true))
            .await
            .expect("locked board still accepts replies");

        for status in [TopicStatus::Locked, TopicStatus::Expired] {
            fx.db
                .with_repositories(|repos| repos.topics().set_status(topic_id, status, Utc::now()))
                .unwrap();
            let err = fx
                .posts
                .append(&reply_input(topic_id, "10.0.0.1", true))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                SubmissionError::Rejected(Rejection::StatusRejected { status: ref got }) if got == status.as_str()
            ));
        }
    }

    #[tokio::test]
    async fn missing_targets_are_not_found() {
        let fx = fixture();
        let err = fx.topics.append(&topic_input("nope", "10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, SubmissionError::NotFound(_)));
        let err = fx.posts.append(&reply_input(42, "10.0.0.1", true)).await.unwrap_err();
        assert!(matches!(err, SubmissionError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_number_is_a_constraint_violation() {
        let fx = fixture();
        create_board(&fx.db, "foo", BoardStatus::Open, BoardSettings::default());
        let topic_id = fx.topics.append(&topic_input("foo", "10.0.0.1")).await.unwrap();
        let err = fx
            .db
            .with_repositories(|repos| {
                repos.posts().create(&NewPost {
                    topic_id,
                    number: 1,
                    name: "dup".into(),
                    body: "dup".into(),
                    bumped: true,
                    ident: None,
                    ident_type: IdentType::None,
                    ip_address: "10.0.0.9".into(),
                    created_at: Utc::now(),
                })
            })
            .unwrap_err();
        assert!(is_constraint_violation(&err));
    }

    fn moderator_reply(topic_id: i64) -> ModeratorReply {
        ModeratorReply {
            topic_id,
            body: "thread locked, take it elsewhere".into(),
            bumped: false,
            ip_address: "10.9.9.9".parse().unwrap(),
            name: "Mod".into(),
            ident: "MOD".into(),
        }
    }

    #[tokio::test]
    async fn moderators_post_under_their_own_name_on_locked_targets() {
        let fx = fixture();
        let settings = BoardSettings {
            max_posts: 3,
            ..BoardSettings::default()
        };
        create_board(&fx.db, "foo", BoardStatus::Open, settings);
        let topic_id = fx.topics.append(&topic_input("foo", "10.0.0.1")).await.unwrap();
        fx.db
            .with_repositories(|repos| {
                repos.boards().set_status(1, BoardStatus::Locked)?;
                repos.topics().set_status(topic_id, TopicStatus::Locked, Utc::now())
            })
            .unwrap();

        let err = fx
            .posts
            .append(&reply_input(topic_id, "10.0.0.2", true))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Rejected(Rejection::StatusRejected { .. })));

        let post_id = fx.posts.append_as_moderator(&moderator_reply(topic_id)).await.unwrap();
        let post = fx
            .db
            .with_repositories(|repos| repos.posts().get(post_id))
            .unwrap()
            .expect("post");
        assert_eq!(post.number, 2);
        assert_eq!(post.name, "Mod");
        assert_eq!(post.ident.as_deref(), Some("MOD"));
        assert_eq!(post.ident_type, IdentType::IdentAdmin);
        assert!(!post.bumped);

        // Reaching the cap does not reopen or archive a locked topic.
        fx.posts.append_as_moderator(&moderator_reply(topic_id)).await.unwrap();
        assert_eq!(topic(&fx.db, topic_id).status, TopicStatus::Locked);
        assert_eq!(meta(&fx.db, topic_id).post_count, 3);

        for status in [TopicStatus::Archived, TopicStatus::Expired] {
            fx.db
                .with_repositories(|repos| repos.topics().set_status(topic_id, status, Utc::now()))
                .unwrap();
            let err = fx
                .posts
                .append_as_moderator(&moderator_reply(topic_id))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                SubmissionError::Rejected(Rejection::StatusRejected { status: ref got }) if got == status.as_str()
            ));
        }
    }

    #[test]
    fn number_conflicts_are_retried_a_bounded_number_of_times() {
        let mut calls = 0;
        let result = retry_number_conflicts(|| {
            calls += 1;
            if calls < 3 {
                Err(SubmissionError::Conflict(7))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);

        let mut calls = 0;
        let result: Result<(), _> = retry_number_conflicts(|| {
            calls += 1;
            Err(SubmissionError::Conflict(7))
        });
        assert!(matches!(result, Err(SubmissionError::Conflict(7))));
        assert_eq!(calls, MAX_NUMBER_CONFLICT_RETRIES);

        let mut calls = 0;
        let result: Result<(), _> = retry_number_conflicts(|| {
            calls += 1;
            Err(SubmissionError::NotFound("topic 7".into()))
        });
        assert!(matches!(result, Err(SubmissionError::NotFound(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn colliding_reply_rolls_back_and_surfaces_a_conflict() {
        let conn = rusqlite::Connection::open_in_memory().expect("conn");
        conn.execute_batch(crate::database::MIGRATIONS).expect("migrate");
        conn.execute_batch(
            r#"
            CREATE TRIGGER posts_collide BEFORE INSERT ON posts
            WHEN NEW.body = 'collide'
            BEGIN
                SELECT RAISE(ABORT, 'UNIQUE constraint failed: posts.topic_id, posts.number');
            END;
            "#,
        )
        .expect("trigger");
        let fx = fixture_with(Database::from_connection(conn, true));
        create_board(&fx.db, "foo", BoardStatus::Open, BoardSettings::default());
        let topic_id = fx.topics.append(&topic_input("foo", "10.0.0.1")).await.unwrap();
        let before = meta(&fx.db, topic_id);

        let mut input = reply_input(topic_id, "10.0.0.2", true);
        input.body = "collide".into();
        let err = fx.posts.append(&input).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Conflict(id) if id == topic_id));
        assert!(err.is_retryable());
        assert_eq!(meta(&fx.db, topic_id), before);

        fx.posts.append(&reply_input(topic_id, "10.0.0.2", true)).await.unwrap();
        assert_eq!(meta(&fx.db, topic_id).post_count, 2);
    }

    #[test]
    fn cap_thresholds() {
        assert!(!caps_new_topic(1, 1000));
        assert!(caps_new_topic(1, 1));
        assert!(!caps_reply(3, 1000));
        assert!(caps_reply(2, 3));
        assert!(caps_reply(3, 3));
        assert!(!caps_reply(1, 3));
    }
}
