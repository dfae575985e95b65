//! Slackpaper keeps one Slack message in sync with a bookmarked section of a
//! TaskPaper outline.
//! The pure core (outline arithmetic, tag grammar, rendering) lives in the first
//! modules; `watch`, `sink`, and `sync` wire it to the filesystem and to Slack.

pub mod core {
    use chrono::{DateTime, Utc};
    use serde::Serialize;
    use std::path::PathBuf;

    /* ------------------------------ Reference ------------------------------ */

    /// Identifies the Slack message a bookmarked header mirrors.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
    pub struct Reference {
        /// Channel ID, e.g. `B05KSNDD4`.
        pub channel: String,
        /// API-form timestamp (`1549566229.043400`), what `chat.update` expects.
        pub timestamp: String,
        /// URL-form timestamp exactly as written in the tag (`p1549566229043400`).
        pub url_timestamp: String,
    }

    impl Reference {
        /// Human-facing link to the message; never used for API calls.
        pub fn permalink(&self, subdomain: &str, domain: &str) -> String {
            format!(
                "https://{}.{}/archives/{}/{}",
                subdomain, domain, self.channel, self.url_timestamp
            )
        }

        /// When the message was posted, decoded from the seconds part of the timestamp.
        pub fn posted_at(&self) -> Option<DateTime<Utc>> {
            let (secs, _) = self.timestamp.split_once('.')?;
            DateTime::from_timestamp(secs.parse().ok()?, 0)
        }
    }

    /* ------------------------------- Subtree ------------------------------- */

    /// A bookmarked header plus its captured descendants, re-based so the header
    /// sits at depth 0. Rebuilt from scratch on every sync cycle.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Subtree {
        pub lines: Vec<String>,
    }

    impl Subtree {
        pub fn header(&self) -> Option<&str> {
            self.lines.first().map(String::as_str)
        }

        /// Every captured line after the header.
        pub fn body(&self) -> &[String] {
            self.lines.get(1..).unwrap_or(&[])
        }

        pub fn is_empty(&self) -> bool {
            self.lines.is_empty()
        }
    }

    /* --------------------------- Rendered message --------------------------- */

    /// Slack-formatted message: one header line and the rendered task lines.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct RenderedMessage {
        pub header: String,
        pub tasks: Vec<String>,
    }

    impl RenderedMessage {
        pub fn text(&self) -> String {
            std::iter::once(self.header.as_str())
                .chain(self.tasks.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        }
    }

    /* ---------------------------- Watch events ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ChangeKind {
        Written,
        Created,
    }

    /// "The document may have changed"; carries no content, each cycle re-reads.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ChangeEvent {
        pub path: PathBuf,
        pub kind: ChangeKind,
    }

    /// Orchestrator state. `Reported` is transient: a cycle always ends in `Idle`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum SyncState {
        #[default]
        Idle,
        Processing,
        Reported,
    }

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ReferenceError {
        #[error("Slack tag not found")]
        NotFound,
        #[error("Slack timestamp too short")]
        TimestampTooShort { len: usize },
    }

    #[derive(Debug, thiserror::Error)]
    pub enum SinkError {
        #[error("request to Slack failed: {0}")]
        Http(#[from] reqwest::Error),
        #[error("Slack rejected the update: {0}")]
        Api(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ConfigError {
        #[error("missing {setting}; pass --{flag} or set {env}")]
        Missing {
            setting: &'static str,
            flag: &'static str,
            env: &'static str,
        },
        #[error("invalid {setting} {value:?}: {reason}")]
        Invalid {
            setting: &'static str,
            value: String,
            reason: String,
        },
    }

    /// Everything a sync cycle (or watch setup) can fail with.
    #[derive(Debug, thiserror::Error)]
    pub enum SyncError {
        #[error("Slack tag not found")]
        ReferenceNotFound,
        #[error("Slack timestamp too short ({len} characters)")]
        TimestampTooShort { len: usize },
        #[error("reading {path:?}: {source}")]
        DocumentRead {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("Slack update error: {0}")]
        Sink(#[from] SinkError),
        #[error("cannot watch {path:?}: {source}")]
        WatchSetup {
            path: PathBuf,
            #[source]
            source: notify::Error,
        },
    }

    impl From<ReferenceError> for SyncError {
        fn from(err: ReferenceError) -> Self {
            match err {
                ReferenceError::NotFound => SyncError::ReferenceNotFound,
                ReferenceError::TimestampTooShort { len } => SyncError::TimestampTooShort { len },
            }
        }
    }
}

pub mod outline {
    //! Indentation arithmetic. Depth is the number of leading tabs; spaces never count.

    pub const INDENT: char = '\t';

    pub fn depth(line: &str) -> usize {
        line.chars().take_while(|c| *c == INDENT).count()
    }

    /// Strip exactly `amount` leading tabs. Lines indented less than `amount`
    /// come back unchanged.
    pub fn rebase(line: &str, amount: usize) -> &str {
        if depth(line) >= amount {
            &line[amount..]
        } else {
            line
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn depth_counts_only_leading_tabs() {
            assert_eq!(depth("something \t\t\t"), 0);
            assert_eq!(depth("\t\t- task\t"), 2);
            assert_eq!(depth("  \t- spaced"), 0);
            assert_eq!(depth(""), 0);
        }

        #[test]
        fn rebase_strips_requested_levels() {
            assert_eq!(rebase("\tfoo", 1), "foo");
            assert_eq!(rebase("\t\t\tfoo", 2), "\tfoo");
        }

        #[test]
        fn rebase_leaves_shallow_lines_alone() {
            assert_eq!(rebase("\tfoo", 3), "\tfoo");
            assert_eq!(rebase("foo", 1), "foo");
            assert_eq!(rebase("\t\tfoo", 0), "\t\tfoo");
        }

        #[test]
        fn rebase_composes() {
            let line = "\t\t\t\t- deep @done";
            for a in 0..=2 {
                for b in 0..=2 {
                    assert_eq!(rebase(rebase(line, a), b), rebase(line, a + b));
                }
            }
        }
    }
}

pub mod grammar {
    //! Named grammar rules for the outline format, built on `nom`.
    //!
    //! - bookmark tag: `@slack(<channel>/<urlTimestamp>)`, both tokens `[A-Za-z0-9]+`
    //! - task marker: `^\t*- `
    //! - tag start: the first `@` on a line; nothing from there on is content

    use nom::{
        IResult,
        bytes::complete::{tag, take_while, take_while1},
        character::complete::char,
        combinator::map,
        sequence::{delimited, separated_pair, terminated},
    };

    type PResult<'a, T> = IResult<&'a str, T>;

    pub const TAG_SIGIL: char = '@';

    fn alnum1(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c.is_ascii_alphanumeric())(i)
    }

    /// Parses a bookmark tag at the start of `i`, yielding `(channel, urlTimestamp)`.
    pub fn bookmark_tag(i: &str) -> PResult<'_, (&str, &str)> {
        delimited(
            tag("@slack("),
            separated_pair(alnum1, char('/'), alnum1),
            char(')'),
        )(i)
    }

    /// Leftmost bookmark tag anywhere on the line.
    pub fn find_bookmark_tag(line: &str) -> Option<(&str, &str)> {
        line.match_indices(TAG_SIGIL)
            .find_map(|(at, _)| bookmark_tag(&line[at..]).ok().map(|(_, tokens)| tokens))
    }

    pub fn is_bookmark_header(line: &str) -> bool {
        find_bookmark_tag(line).is_some()
    }

    /// Leading tabs followed by `- `; yields the tab count, remainder is the task body.
    pub fn task_marker(i: &str) -> PResult<'_, usize> {
        map(
            terminated(take_while(|c: char| c == '\t'), tag("- ")),
            |tabs: &str| tabs.len(),
        )(i)
    }

    /// Everything before the first tag.
    pub fn content(line: &str) -> &str {
        line.split_once(TAG_SIGIL).map_or(line, |(before, _)| before)
    }

    /// Plain text match on `@name`; values and word boundaries are not checked.
    pub fn has_tag(line: &str, name: &str) -> bool {
        line.match_indices(TAG_SIGIL)
            .any(|(at, _)| line[at + 1..].starts_with(name))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn bookmark_header_needs_both_tokens() {
            assert!(!is_bookmark_header("Header: @something()"));
            assert!(!is_bookmark_header("\t\tHeader: @slack(asd)"));
            assert!(is_bookmark_header("\t\tHeader: @slack(asd/123)"));
        }

        #[test]
        fn bookmark_tag_rejects_non_alphanumeric_tokens() {
            assert!(!is_bookmark_header("Header @slack(B05-KSN/p1549566229043400)"));
            assert!(!is_bookmark_header("Header @slack(/p1549566229043400)"));
            assert!(!is_bookmark_header("Header @slack(B05KSNDD4/p15495662290434.00)"));
        }

        #[test]
        fn find_bookmark_tag_skips_earlier_tags() {
            let line = "Today @due(2019-02-07) @slack(B05KSNDD4/p1549566229043400) @x";
            assert_eq!(
                find_bookmark_tag(line),
                Some(("B05KSNDD4", "p1549566229043400"))
            );
        }

        #[test]
        fn task_marker_counts_tabs() {
            assert_eq!(task_marker("- milk"), Ok(("milk", 0)));
            assert_eq!(task_marker("\t\t- milk"), Ok(("milk", 2)));
            assert!(task_marker("\tnested text").is_err());
            assert!(task_marker("-milk").is_err());
            assert!(task_marker(" - milk").is_err());
        }

        #[test]
        fn content_stops_at_first_tag() {
            assert_eq!(content("- getmilk @done(2018) @doing"), "- getmilk ");
            assert_eq!(content("no tags here"), "no tags here");
        }

        #[test]
        fn has_tag_matches_text() {
            assert!(has_tag("- x @done(2018-01-01)", "done"));
            assert!(has_tag("- x @doing asd", "doing"));
            assert!(!has_tag("- x @doing", "done"));
            assert!(!has_tag("- done", "done"));
        }
    }
}

pub mod reference {
    //! Turns a header's bookmark tag into a Slack message reference.

    use crate::core::{Reference, ReferenceError};
    use crate::grammar;

    /// Shortest accepted URL timestamp, counted as written (leading `p` included).
    pub const MIN_URL_TIMESTAMP_LEN: usize = 16;
    const SECONDS_LEN: usize = 10;

    pub fn parse_reference(line: &str) -> Result<Reference, ReferenceError> {
        let (channel, url_timestamp) =
            grammar::find_bookmark_tag(line).ok_or(ReferenceError::NotFound)?;
        if url_timestamp.len() < MIN_URL_TIMESTAMP_LEN {
            return Err(ReferenceError::TimestampTooShort {
                len: url_timestamp.len(),
            });
        }
        Ok(Reference {
            channel: channel.to_string(),
            timestamp: api_timestamp(url_timestamp),
            url_timestamp: url_timestamp.to_string(),
        })
    }

    /// `p1549566229043400` -> `1549566229.043400`.
    pub fn api_timestamp(url_timestamp: &str) -> String {
        let digits = url_timestamp.strip_prefix('p').unwrap_or(url_timestamp);
        let (secs, fraction) = digits.split_at(SECONDS_LEN.min(digits.len()));
        format!("{secs}.{fraction}")
    }

}

pub mod locator {
    //! Finds the first bookmarked header and captures its subtree.

    use crate::core::Subtree;
    use crate::grammar;
    use crate::outline::{depth, rebase};

    /// Single top-to-bottom pass. Capture starts at the first line carrying a
    /// bookmark tag and stops at the first later line indented less than it.
    /// Later bookmarks are never considered.
    pub fn find_bookmark(document: &str) -> Subtree {
        let mut captured: Vec<&str> = Vec::new();
        let mut reading_depth: Option<usize> = None;

        for line in document.lines() {
            match reading_depth {
                Some(base) if depth(line) < base => break,
                Some(_) => {}
                None if grammar::is_bookmark_header(line) => reading_depth = Some(depth(line)),
                None => continue,
            }
            captured.push(line);
        }

        let base = captured.first().map_or(0, |line| depth(line));
        Subtree {
            lines: captured
                .into_iter()
                .map(|line| rebase(line, base).to_string())
                .collect(),
        }
    }

}

pub mod render {
    //! Converts a re-based subtree into Slack message lines.

    use crate::core::{RenderedMessage, Subtree};
    use crate::grammar;
    use crate::outline::rebase;

    pub const HEADER_GLYPH: &str = ":calendar:";
    /// Slack collapses tabs, so nesting is spelled out in spaces.
    pub const SPACES_PER_TAB: usize = 6;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TaskStatus {
        Todo,
        Doing,
        Done,
    }

    impl TaskStatus {
        /// `@done` wins over `@doing`.
        pub fn of(line: &str) -> Self {
            if grammar::has_tag(line, "done") {
                TaskStatus::Done
            } else if grammar::has_tag(line, "doing") {
                TaskStatus::Doing
            } else {
                TaskStatus::Todo
            }
        }

        pub fn glyph(self) -> &'static str {
            match self {
                TaskStatus::Todo => ":todo: ",
                TaskStatus::Doing => ":doing: ",
                TaskStatus::Done => ":done: ",
            }
        }
    }

    pub fn render_header(line: &str) -> String {
        let title = grammar::content(line);
        let title = title.split_once(':').map_or(title, |(before, _)| before);
        format!("{} *{}*", HEADER_GLYPH, title.trim())
    }

    /// Renders one body line, or `None` when it is not a task (notes, plain headers).
    pub fn render_task_line(line: &str) -> Option<String> {
        let line = rebase(line, 1);
        let (body, tabs) = grammar::task_marker(line).ok()?;
        let status = TaskStatus::of(line);
        let text = grammar::content(body).trim_end();
        let indent = " ".repeat(tabs * SPACES_PER_TAB);
        let rendered = format!("{indent}{}{text}", status.glyph());
        Some(rendered.trim_end().to_string())
    }

    pub fn render_subtree(subtree: &Subtree) -> RenderedMessage {
        RenderedMessage {
            header: render_header(subtree.header().unwrap_or_default()),
            tasks: subtree
                .body()
                .iter()
                .filter_map(|line| render_task_line(line))
                .collect(),
        }
    }

}

pub mod pipeline {
    //! Document text in, (reference, message) out.

    use crate::core::{Reference, ReferenceError, RenderedMessage, Subtree};
    use crate::locator::find_bookmark;
    use crate::reference::parse_reference;
    use crate::render::render_subtree;
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Prepared {
        pub reference: Reference,
        pub message: RenderedMessage,
    }

    pub fn prepare_message(document: &str) -> Result<Prepared, ReferenceError> {
        let subtree: Subtree = find_bookmark(document);
        let reference = parse_reference(subtree.header().unwrap_or_default())?;
        Ok(Prepared {
            reference,
            message: render_subtree(&subtree),
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn renders_bookmarked_section() {
            let source = "Today tasks: @slack(B05KSNDD4/p1549566229043400)
\t- do something
\t\tnested text
\t- and other stuff";
            let prepared = prepare_message(source).expect("prepare");
            assert_eq!(prepared.reference.channel, "B05KSNDD4");
            assert_eq!(prepared.reference.timestamp, "1549566229.043400");
            assert_eq!(
                prepared.message.text(),
                ":calendar: *Today tasks*\n:todo: do something\n:todo: and other stuff"
            );
        }

        #[test]
        fn nested_task_keeps_relative_indent() {
            let source = "Today tasks: @slack(B05KSNDD4/p1549566229043400)
\t- do something
\t\tnested text
\t\t- nested task";
            let prepared = prepare_message(source).expect("prepare");
            assert_eq!(
                prepared.message.text(),
                ":calendar: *Today tasks*\n:todo: do something\n      :todo: nested task"
            );
        }

        #[test]
        fn syncs_first_bookmark_of_larger_document() {
            let content = "
asdasd
\t- asdasdasd
Header with no tag:
Greater thing:
\tToday tasks: @slack(B05KSNDD4/p154956622904340)
\t\t- do something
\t\t\tnested text
other shit
\tSecond tasks: @slack(messageid)
\t\t- do me
";
            let prepared = prepare_message(content).expect("prepare");
            assert_eq!(
                prepared.reference,
                Reference {
                    channel: "B05KSNDD4".into(),
                    timestamp: "1549566229.04340".into(),
                    url_timestamp: "p154956622904340".into(),
                }
            );
            assert_eq!(
                prepared.message.text(),
                ":calendar: *Today tasks*\n:todo: do something"
            );
        }

        #[test]
        fn document_without_bookmark_is_not_found() {
            let err = prepare_message("Plain header:\n\t- task @done\n").unwrap_err();
            assert_eq!(err, ReferenceError::NotFound);
        }

        #[test]
        fn short_bookmark_timestamp_is_reported() {
            let err = prepare_message("Today: @slack(asd/123123)\n\t- x").unwrap_err();
            assert_eq!(err, ReferenceError::TimestampTooShort { len: 6 });
        }
    }
}

pub mod config {
    //! Process configuration, validated once at startup and passed down explicitly.

    use crate::core::{ConfigError, Reference};
    use std::path::PathBuf;

    pub const DEFAULT_DOMAIN: &str = "slack.com";
    pub const DEFAULT_API_BASE: &str = "https://slack.com/api";

    #[derive(Clone, PartialEq, Eq)]
    pub struct SyncConfig {
        pub token: String,
        /// Workspace subdomain used for permalinks (`acme` in `acme.slack.com`).
        pub subdomain: String,
        pub domain: String,
        /// Base URL for Web API methods, without trailing slash.
        pub api_base: String,
        pub document: PathBuf,
    }

    impl std::fmt::Debug for SyncConfig {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SyncConfig")
                .field("token", &"<redacted>")
                .field("subdomain", &self.subdomain)
                .field("domain", &self.domain)
                .field("api_base", &self.api_base)
                .field("document", &self.document)
                .finish()
        }
    }

    impl SyncConfig {
        pub fn new(
            token: Option<String>,
            subdomain: Option<String>,
            domain: String,
            api_base: String,
            document: PathBuf,
        ) -> Result<Self, ConfigError> {
            let token = required(token, "Slack token", "token", "SLACK_TOKEN")?;
            let subdomain = required(subdomain, "Slack subdomain", "subdomain", "SLACK_SUBDOMAIN")?;
            if subdomain.contains(['/', '.']) || subdomain.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid {
                    setting: "Slack subdomain",
                    value: subdomain,
                    reason: "expected a bare workspace name such as `acme`".into(),
                });
            }

            let api_base = api_base.trim().trim_end_matches('/').to_string();
            match reqwest::Url::parse(&api_base) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                Ok(url) => {
                    return Err(ConfigError::Invalid {
                        setting: "API base URL",
                        value: api_base,
                        reason: format!("unsupported scheme `{}`", url.scheme()),
                    });
                }
                Err(err) => {
                    return Err(ConfigError::Invalid {
                        setting: "API base URL",
                        value: api_base,
                        reason: err.to_string(),
                    });
                }
            }

            Ok(Self {
                token,
                subdomain,
                domain: domain.trim().to_string(),
                api_base,
                document,
            })
        }

        pub fn permalink(&self, reference: &Reference) -> String {
            reference.permalink(&self.subdomain, &self.domain)
        }
    }

    fn required(
        value: Option<String>,
        setting: &'static str,
        flag: &'static str,
        env: &'static str,
    ) -> Result<String, ConfigError> {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing { setting, flag, env })
    }

}

pub mod sink {
    //! The remote side: something that can overwrite a message by reference.

    use crate::config::SyncConfig;
    use crate::core::{Reference, SinkError};
    use serde::{Deserialize, Serialize};
    use std::future::Future;

    pub trait MessageSink: Send + Sync {
        /// Replace the full text of the referenced message.
        fn update_message(
            &self,
            reference: &Reference,
            text: &str,
        ) -> impl Future<Output = Result<(), SinkError>> + Send;
    }

    /// `chat.update` over the Slack Web API.
    pub struct SlackSink {
        client: reqwest::Client,
        token: String,
        api_base: String,
    }

    impl SlackSink {
        pub fn new(config: &SyncConfig) -> Self {
            Self {
                client: reqwest::Client::new(),
                token: config.token.clone(),
                api_base: config.api_base.clone(),
            }
        }

        fn endpoint(&self) -> String {
            format!("{}/chat.update", self.api_base)
        }
    }

    #[derive(Debug, Serialize)]
    struct UpdateRequest<'a> {
        channel: &'a str,
        ts: &'a str,
        text: &'a str,
    }

    /// Slack answers 200 even on failure; `ok` carries the verdict.
    #[derive(Debug, Deserialize)]
    struct SlackResponse {
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    }

    impl SlackResponse {
        fn into_result(self) -> Result<(), SinkError> {
            if self.ok {
                Ok(())
            } else {
                Err(SinkError::Api(
                    self.error.unwrap_or_else(|| "unknown_error".to_string()),
                ))
            }
        }
    }

    impl MessageSink for SlackSink {
        async fn update_message(&self, reference: &Reference, text: &str) -> Result<(), SinkError> {
            let request = UpdateRequest {
                channel: &reference.channel,
                ts: &reference.timestamp,
                text,
            };
            tracing::debug!(
                channel = %reference.channel,
                ts = %reference.timestamp,
                "calling chat.update"
            );
            let response = self
                .client
                .post(self.endpoint())
                .bearer_auth(&self.token)
                .json(&request)
                .send()
                .await?
                .error_for_status()?;
            let body: SlackResponse = response.json().await?;
            body.into_result()
        }
    }

}

pub mod watch {
    //! Filesystem subscription for one document.
    //!
    //! The parent directory is watched so editors that save via rename still
    //! produce events; everything is filtered down to the document's file name.

    use crate::core::{ChangeEvent, ChangeKind, SyncError};
    use notify::{
        Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
        event::{ModifyKind, RenameMode},
    };
    use std::ffi::OsStr;
    use std::path::{Path, PathBuf};
    use tokio::sync::mpsc;

    /// Ordered stream of change events. Dropping it ends the subscription.
    pub struct DocumentWatcher {
        _watcher: RecommendedWatcher,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        path: PathBuf,
    }

    impl std::fmt::Debug for DocumentWatcher {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DocumentWatcher")
                .field("path", &self.path)
                .finish_non_exhaustive()
        }
    }

    impl DocumentWatcher {
        pub fn new(document: &Path) -> Result<Self, SyncError> {
            let setup_error = |source: notify::Error| SyncError::WatchSetup {
                path: document.to_path_buf(),
                source,
            };

            let canonical = document.canonicalize().map_err(|_| {
                setup_error(notify::Error::path_not_found().add_path(document.to_path_buf()))
            })?;
            let file_name = canonical
                .file_name()
                .ok_or_else(|| {
                    setup_error(notify::Error::generic("document path has no file name"))
                })?
                .to_os_string();
            let parent = canonical
                .parent()
                .ok_or_else(|| {
                    setup_error(notify::Error::generic("document path has no parent directory"))
                })?
                .to_path_buf();

            let (tx, rx) = mpsc::unbounded_channel();
            let mut watcher = RecommendedWatcher::new(
                move |result: notify::Result<Event>| match result {
                    Ok(event) => {
                        let Some(change) = classify(&event, &file_name) else {
                            tracing::trace!(kind = ?event.kind, "ignoring event");
                            return;
                        };
                        if tx.send(change).is_err() {
                            tracing::trace!("watch consumer gone; dropping event");
                        }
                    }
                    Err(err) => tracing::warn!("file watch error: {err}"),
                },
                Config::default(),
            )
            .map_err(setup_error)?;

            watcher
                .watch(&parent, RecursiveMode::NonRecursive)
                .map_err(setup_error)?;

            tracing::info!(path = %canonical.display(), "watching document");
            Ok(Self {
                _watcher: watcher,
                events: rx,
                path: canonical,
            })
        }

        /// Next change, in arrival order. `None` once the subscription is closed.
        pub async fn next(&mut self) -> Option<ChangeEvent> {
            self.events.recv().await
        }
    }

    /// Keeps write and create events that touch `file_name`; drops everything else.
    /// A rename onto the document counts as a create: the path now holds new content.
    pub fn classify(event: &Event, file_name: &OsStr) -> Option<ChangeEvent> {
        let kind = match event.kind {
            EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any,
            )) => ChangeKind::Created,
            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => ChangeKind::Written,
            _ => return None,
        };
        let path = event
            .paths
            .iter()
            .find(|path| path.file_name() == Some(file_name))?;
        Some(ChangeEvent {
            path: path.clone(),
            kind,
        })
    }

}

pub mod sync {
    //! The watch loop: every change event runs one full read, render, update cycle.

    use crate::config::SyncConfig;
    use crate::core::{ChangeEvent, Reference, SyncError, SyncState};
    use crate::pipeline::prepare_message;
    use crate::sink::MessageSink;
    use crate::watch::DocumentWatcher;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CycleReport {
        pub reference: Reference,
        pub permalink: String,
    }

    pub struct Syncer<S> {
        config: SyncConfig,
        sink: S,
        state: SyncState,
    }

    impl<S: MessageSink> Syncer<S> {
        pub fn new(config: SyncConfig, sink: S) -> Self {
            Self {
                config,
                sink,
                state: SyncState::Idle,
            }
        }

        pub fn state(&self) -> SyncState {
            self.state
        }

        /// One cycle without state bookkeeping or reporting.
        pub async fn sync_once(&self) -> Result<CycleReport, SyncError> {
            let path = &self.config.document;
            let document = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| SyncError::DocumentRead {
                    path: path.clone(),
                    source,
                })?;
            let prepared = prepare_message(&document)?;
            self.sink
                .update_message(&prepared.reference, &prepared.message.text())
                .await?;
            Ok(CycleReport {
                permalink: self.config.permalink(&prepared.reference),
                reference: prepared.reference,
            })
        }

        /// Runs a full cycle for `event` and reports it. Always returns to `Idle`.
        pub async fn handle(&mut self, event: &ChangeEvent) -> Result<CycleReport, SyncError> {
            tracing::debug!(path = %event.path.display(), kind = ?event.kind, "document changed");
            self.transition(SyncState::Processing);
            let outcome = self.sync_once().await;
            report(&outcome);
            self.transition(SyncState::Reported);
            self.transition(SyncState::Idle);
            outcome
        }

        /// Drains the watcher until it closes, one cycle at a time.
        pub async fn run(mut self, mut watcher: DocumentWatcher) {
            while let Some(event) = watcher.next().await {
                let _ = self.handle(&event).await;
            }
            tracing::debug!("watch subscription closed");
        }

        fn transition(&mut self, next: SyncState) {
            tracing::trace!(from = ?self.state, to = ?next, "sync state");
            self.state = next;
        }
    }

    /// The single status line each cycle produces.
    pub fn report(outcome: &Result<CycleReport, SyncError>) {
        match outcome {
            Ok(report) => tracing::info!("Updated: {}", report.permalink),
            Err(err) => tracing::error!("Sync failed: {err}"),
        }
    }

}
