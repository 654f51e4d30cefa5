use crate::database::models::{BoardSettings, BoardStatus, PostQuery, TopicStatus};
use crate::database::repositories::{BoardRepository, PostRepository, TopicRepository};
use crate::filters::Payload;
use crate::moderation::{AddBanInput, AddBanwordInput, CreateBoardInput};
use crate::node::TextboardNode;
use crate::pipeline::{ReplySubmission, TopicSubmission};
use crate::posting::ModeratorReply;
use crate::tasks::{TaskState, TaskUid};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Subcommand)]
pub enum Command {
    /// Create a board
    CreateBoard(CreateBoardArgs),
    /// Change a board's status (open, restricted, locked, archived)
    SetBoardStatus { slug: String, status: String },
    /// Change a topic's status (open, locked, archived, expired)
    SetTopicStatus { topic_id: i64, status: String },
    /// Manage address bans
    Ban {
        #[command(subcommand)]
        action: BanAction,
    },
    /// Manage banned expressions
    Banword {
        #[command(subcommand)]
        action: BanwordAction,
    },
    /// Submit a new topic and wait for the result
    Topic(TopicArgs),
    /// Submit a reply and wait for the result
    Reply(ReplyArgs),
    /// Post to a topic as a moderator, bypassing the queue and filters
    ModReply(ModReplyArgs),
    /// Print a board's topics or a topic's posts
    Show {
        #[command(subcommand)]
        target: ShowTarget,
    },
}

#[derive(Args)]
pub struct CreateBoardArgs {
    pub slug: String,
    pub title: String,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long, default_value = "open")]
    pub status: String,
    /// Display name given to every post
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub no_ident: bool,
    #[arg(long)]
    pub max_posts: Option<u32>,
    /// Seconds between posts from one address
    #[arg(long)]
    pub post_delay: Option<u64>,
}

#[derive(Subcommand)]
pub enum BanAction {
    /// Ban a network (CIDR) or a single address
    Add {
        network: String,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        days: Option<u32>,
    },
    /// Deactivate a ban
    Lift { id: i64 },
}

#[derive(Subcommand)]
pub enum BanwordAction {
    /// Reject bodies matching a regular expression
    Add {
        expr: String,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Deactivate a banword
    Lift { id: i64 },
}

#[derive(Args)]
pub struct SubmissionArgs {
    /// Source address of the submission
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: IpAddr,
    /// Extra payload entries for external checks, as key=value
    #[arg(long = "payload", value_parser = parse_payload_entry)]
    pub payload: Vec<(String, String)>,
    /// Seconds to wait for the task to resolve
    #[arg(long, default_value_t = 30)]
    pub wait: u64,
}

#[derive(Args)]
pub struct TopicArgs {
    pub board: String,
    pub title: String,
    pub body: String,
    #[command(flatten)]
    pub submission: SubmissionArgs,
}

#[derive(Args)]
pub struct ReplyArgs {
    pub topic_id: i64,
    pub body: String,
    /// Reply without bumping the topic
    #[arg(long)]
    pub sage: bool,
    #[command(flatten)]
    pub submission: SubmissionArgs,
}

#[derive(Args)]
pub struct ModReplyArgs {
    pub topic_id: i64,
    pub body: String,
    #[arg(long, default_value = "Moderator")]
    pub name: String,
    /// Ident shown instead of a generated one
    #[arg(long, default_value = "Mod")]
    pub ident: String,
    #[arg(long)]
    pub sage: bool,
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: IpAddr,
}

#[derive(Subcommand)]
pub enum ShowTarget {
    /// List the newest topics of a board
    Board {
        slug: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List posts of a topic: all, N, A-B, lN or recent
    Topic {
        topic_id: i64,
        #[arg(default_value = "all")]
        query: String,
    },
}

fn parse_payload_entry(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("payload entry {raw:?} must be key=value"))?;
    Ok((key.trim().to_string(), value.to_string()))
}

pub async fn run(node: &TextboardNode, command: Command) -> Result<()> {
    match command {
        Command::CreateBoard(args) => create_board(node, args),
        Command::SetBoardStatus { slug, status } => {
            let status: BoardStatus = status.parse()?;
            print_json(&node.moderation().set_board_status(&slug, status)?)
        }
        Command::SetTopicStatus { topic_id, status } => {
            let status: TopicStatus = status.parse()?;
            print_json(&node.moderation().set_topic_status(topic_id, status)?)
        }
        Command::Ban { action } => match action {
            BanAction::Add {
                network,
                scope,
                description,
                days,
            } => {
                let id = node.moderation().add_ban(AddBanInput {
                    ip_address: network,
                    scope,
                    description,
                    duration_days: days,
                })?;
                println!("ban {id} added");
                Ok(())
            }
            BanAction::Lift { id } => {
                node.moderation().set_ban_active(id, false)?;
                println!("ban {id} lifted");
                Ok(())
            }
        },
        Command::Banword { action } => match action {
            BanwordAction::Add {
                expr,
                scope,
                description,
            } => {
                let id = node.moderation().add_banword(AddBanwordInput {
                    expr,
                    scope,
                    description,
                })?;
                println!("banword {id} added");
                Ok(())
            }
            BanwordAction::Lift { id } => {
                node.moderation().set_banword_active(id, false)?;
                println!("banword {id} lifted");
                Ok(())
            }
        },
        Command::Topic(args) => {
            let uid = node
                .submit_topic(TopicSubmission {
                    board_slug: args.board,
                    title: args.title,
                    body: args.body,
                    ip_address: args.submission.ip,
                    payload: payload_from(&args.submission),
                })
                .await?;
            wait_and_print(node, uid, args.submission.wait).await
        }
        Command::Reply(args) => {
            let uid = node
                .submit_reply(ReplySubmission {
                    topic_id: args.topic_id,
                    body: args.body,
                    bumped: !args.sage,
                    ip_address: args.submission.ip,
                    payload: payload_from(&args.submission),
                })
                .await?;
            wait_and_print(node, uid, args.submission.wait).await
        }
        Command::ModReply(args) => {
            let post_id = node
                .post_as_moderator(ModeratorReply {
                    topic_id: args.topic_id,
                    body: args.body,
                    bumped: !args.sage,
                    ip_address: args.ip,
                    name: args.name,
                    ident: args.ident,
                })
                .await?;
            print_json(&serde_json::json!({ "post_id": post_id }))
        }
        Command::Show { target } => show(node, target),
    }
}

fn create_board(node: &TextboardNode, args: CreateBoardArgs) -> Result<()> {
    let defaults = BoardSettings::default();
    let settings = BoardSettings {
        name: args.name.unwrap_or(defaults.name),
        use_ident: !args.no_ident,
        max_posts: args.max_posts.unwrap_or(defaults.max_posts),
        post_delay: args.post_delay.unwrap_or(defaults.post_delay),
        expire_duration: defaults.expire_duration,
    };
    let board = node.moderation().create_board(CreateBoardInput {
        slug: args.slug,
        title: args.title,
        description: args.description,
        status: args.status.parse()?,
        settings,
    })?;
    print_json(&board)
}

#[derive(Serialize)]
struct ResolvedTask<'a> {
    uid: &'a str,
    #[serde(flatten)]
    state: TaskState,
}

fn payload_from(args: &SubmissionArgs) -> Payload {
    args.payload.iter().cloned().collect()
}

async fn wait_and_print(node: &TextboardNode, uid: TaskUid, wait: u64) -> Result<()> {
    let state = node.wait_for(&uid, Duration::from_secs(wait)).await?;
    print_json(&ResolvedTask { uid: &uid, state })
}

fn show(node: &TextboardNode, target: ShowTarget) -> Result<()> {
    let database = node.database();
    match target {
        ShowTarget::Board { slug, limit } => {
            let listing = database.with_repositories(|repos| {
                let board = repos
                    .boards()
                    .get_by_slug(&slug)?
                    .ok_or_else(|| anyhow!("board {slug} not found"))?;
                let mut topics = Vec::new();
                for topic in repos.topics().list_for_board(board.id, limit)? {
                    let meta = repos.topics().get_meta(topic.id)?;
                    topics.push(serde_json::json!({ "topic": topic, "meta": meta }));
                }
                Ok(serde_json::json!({ "board": board, "topics": topics }))
            })?;
            print_json(&listing)
        }
        ShowTarget::Topic { topic_id, query } => {
            let query: PostQuery = query.parse()?;
            let posts = database.with_repositories(|repos| {
                if repos.topics().get(topic_id)?.is_none() {
                    return Err(anyhow!("topic {topic_id} not found"));
                }
                repos.posts().list_for_topic(topic_id, query)
            })?;
            print_json(&posts)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}
