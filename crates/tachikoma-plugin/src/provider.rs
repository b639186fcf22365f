//! Provider plugins
//!
//! Providers are work-tracking backends. [`ProviderAdapter`] exposes a
//! provider plugin through the host's [`WorkProvider`] interface; every
//! optional operation is gated by the capabilities its manifest declares.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{
    methods, AddCommentParams, AttachmentContentResult, AttachmentParams, AttachmentResult,
    BranchParams, CommentResult, CreatePrParams, FetchParams, LabelsParams, LinkedBranchResult,
    ListParams, MatchParams, MatchResult, ParseParams, ParseResult, PersonResult,
    PullRequestResult, SnapshotParams, SnapshotResult, UpdateStatusParams, WorkUnitRef,
    WorkUnitResult,
};
use crate::{Manifest, PluginError, Process, Result};

// -- domain types -------------------------------------------------------------

/// Work unit status
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Open,
    InProgress,
    Review,
    Done,
    Closed,
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Review => "review",
            Status::Done => "done",
            Status::Closed => "closed",
            Status::Other(s) => s,
        }
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        match s {
            "open" => Status::Open,
            "in_progress" => Status::InProgress,
            "review" => Status::Review,
            "done" => Status::Done,
            "closed" => Status::Closed,
            other => Status::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work unit priority, ordered from lowest to highest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Priority from its wire number; unknown numbers are normal.
    pub fn from_wire(value: i64) -> Self {
        match value {
            0 => Priority::Low,
            2 => Priority::High,
            3 => Priority::Critical,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub author: Person,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub url: String,
    pub content_type: String,
    pub size: i64,
}

/// Where a work unit came from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceInfo {
    /// Provider type
    pub kind: String,
    pub reference: String,
    pub url: String,
}

/// A task from any provider
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub id: String,
    pub external_id: String,
    pub provider: String,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub priority: Priority,
    pub labels: Vec<String>,
    pub assignees: Vec<Person>,
    pub comments: Vec<Comment>,
    pub attachments: Vec<Attachment>,
    pub subtasks: Vec<String>,
    pub metadata: Map<String, Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub source: SourceInfo,

    /// User-facing key used in branch and commit names
    pub external_key: String,
    pub task_type: String,
    pub slug: String,
}

/// Filters for [`WorkProvider::list`]
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub status: Option<Status>,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Provider-specific options such as ordering
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct PullRequestOptions {
    /// Work unit the pull request belongs to, if any
    pub work_unit_id: String,
    pub title: String,
    pub body: String,
    pub source_branch: String,
    pub target_branch: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullRequest {
    pub id: String,
    pub number: i64,
    pub url: String,
    pub state: String,
}

/// Read-only copy of source content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Reference the snapshot was taken from
    pub reference: String,
    pub content: String,
    pub metadata: Map<String, Value>,
}

// -- capabilities -------------------------------------------------------------

/// Optional provider features
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Read,
    List,
    DownloadAttachment,
    FetchComments,
    Comment,
    UpdateStatus,
    ManageLabels,
    Snapshot,
    CreatePr,
    LinkBranch,
    CreateWorkUnit,
    FetchSubtasks,
}

impl Capability {
    pub const ALL: [Capability; 12] = [
        Capability::Read,
        Capability::List,
        Capability::DownloadAttachment,
        Capability::FetchComments,
        Capability::Comment,
        Capability::UpdateStatus,
        Capability::ManageLabels,
        Capability::Snapshot,
        Capability::CreatePr,
        Capability::LinkBranch,
        Capability::CreateWorkUnit,
        Capability::FetchSubtasks,
    ];

    /// Name used in manifests and init replies.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::List => "list",
            Capability::DownloadAttachment => "download_attachment",
            Capability::FetchComments => "fetch_comments",
            Capability::Comment => "comment",
            Capability::UpdateStatus => "update_status",
            Capability::ManageLabels => "manage_labels",
            Capability::Snapshot => "snapshot",
            Capability::CreatePr => "create_pr",
            Capability::LinkBranch => "link_branch",
            Capability::CreateWorkUnit => "create_work_unit",
            Capability::FetchSubtasks => "fetch_subtasks",
        }
    }

    /// Capability for a manifest name; unknown names have none.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cap| cap.as_str() == name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type CapabilitySet = BTreeSet<Capability>;

// -- provider interface -------------------------------------------------------

/// The host's view of a work-tracking backend.
///
/// Only the identifier and reader operations are required. Every other
/// operation fails with a capability error unless implemented.
#[async_trait]
pub trait WorkProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    /// Whether `input` is a reference this provider understands.
    async fn matches(&self, cancel: &CancellationToken, input: &str) -> bool;

    /// Normalize a reference into a work unit id.
    async fn parse(&self, cancel: &CancellationToken, input: &str) -> Result<String>;

    async fn fetch(&self, cancel: &CancellationToken, id: &str) -> Result<WorkUnit>;

    async fn list(&self, _cancel: &CancellationToken, _options: &ListOptions) -> Result<Vec<WorkUnit>> {
        Err(PluginError::capability(self.name(), Capability::List.as_str()))
    }

    async fn add_comment(
        &self,
        _cancel: &CancellationToken,
        _work_unit_id: &str,
        _body: &str,
    ) -> Result<Comment> {
        Err(PluginError::capability(self.name(), Capability::Comment.as_str()))
    }

    async fn update_status(
        &self,
        _cancel: &CancellationToken,
        _work_unit_id: &str,
        _status: &Status,
    ) -> Result<()> {
        Err(PluginError::capability(self.name(), Capability::UpdateStatus.as_str()))
    }

    async fn add_labels(
        &self,
        _cancel: &CancellationToken,
        _work_unit_id: &str,
        _labels: &[String],
    ) -> Result<()> {
        Err(PluginError::capability(self.name(), Capability::ManageLabels.as_str()))
    }

    async fn remove_labels(
        &self,
        _cancel: &CancellationToken,
        _work_unit_id: &str,
        _labels: &[String],
    ) -> Result<()> {
        Err(PluginError::capability(self.name(), Capability::ManageLabels.as_str()))
    }

    async fn create_pull_request(
        &self,
        _cancel: &CancellationToken,
        _options: &PullRequestOptions,
    ) -> Result<PullRequest> {
        Err(PluginError::capability(self.name(), Capability::CreatePr.as_str()))
    }

    async fn link_branch(
        &self,
        _cancel: &CancellationToken,
        _work_unit_id: &str,
        _branch: &str,
    ) -> Result<()> {
        Err(PluginError::capability(self.name(), Capability::LinkBranch.as_str()))
    }

    async fn unlink_branch(
        &self,
        _cancel: &CancellationToken,
        _work_unit_id: &str,
        _branch: &str,
    ) -> Result<()> {
        Err(PluginError::capability(self.name(), Capability::LinkBranch.as_str()))
    }

    async fn get_linked_branch(&self, _cancel: &CancellationToken, _work_unit_id: &str) -> Result<String> {
        Err(PluginError::capability(self.name(), Capability::LinkBranch.as_str()))
    }

    /// Raw attachment content as sent by the provider.
    async fn download_attachment(
        &self,
        _cancel: &CancellationToken,
        _work_unit_id: &str,
        _attachment_id: &str,
    ) -> Result<String> {
        Err(PluginError::capability(
            self.name(),
            Capability::DownloadAttachment.as_str(),
        ))
    }

    async fn snapshot(&self, _cancel: &CancellationToken, _id: &str) -> Result<Snapshot> {
        Err(PluginError::capability(self.name(), Capability::Snapshot.as_str()))
    }

    async fn fetch_comments(&self, _cancel: &CancellationToken, _work_unit_id: &str) -> Result<Vec<Comment>> {
        Err(PluginError::capability(self.name(), Capability::FetchComments.as_str()))
    }
}

// -- adapter ------------------------------------------------------------------

/// A provider plugin behind the [`WorkProvider`] interface
#[derive(Debug, Clone)]
pub struct ProviderAdapter {
    manifest: Arc<Manifest>,
    process: Arc<Process>,
}

impl ProviderAdapter {
    pub fn new(manifest: Arc<Manifest>, process: Arc<Process>) -> Self {
        Self { manifest, process }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Auto-detection priority from the manifest; higher is checked first.
    pub fn priority(&self) -> i32 {
        self.manifest.provider.as_ref().map_or(0, |p| p.priority)
    }

    /// URI schemes declared in the manifest.
    pub fn schemes(&self) -> &[String] {
        self.manifest
            .provider
            .as_ref()
            .map_or(&[], |p| p.schemes.as_slice())
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.manifest.has_capability(capability.as_str()) {
            Ok(())
        } else {
            debug!(plugin = %self.manifest.name, %capability, "capability not declared");
            Err(PluginError::capability(&self.manifest.name, capability.as_str()))
        }
    }

    async fn call<P, R>(&self, cancel: &CancellationToken, method: &str, params: P) -> Result<R>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        self.process.call(cancel, method, params).await
    }

    async fn notify<P: Serialize + Send>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: P,
    ) -> Result<()> {
        self.process.call_raw(cancel, method, params).await.map(drop)
    }
}

#[async_trait]
impl WorkProvider for ProviderAdapter {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn capabilities(&self) -> CapabilitySet {
        let mut caps = CapabilitySet::from([Capability::Read]);
        if let Some(provider) = &self.manifest.provider {
            caps.extend(
                provider
                    .capabilities
                    .iter()
                    .filter_map(|name| Capability::from_name(name)),
            );
        }
        caps
    }

    async fn matches(&self, cancel: &CancellationToken, input: &str) -> bool {
        let params = MatchParams {
            input: input.to_string(),
        };
        match self
            .call::<_, MatchResult>(cancel, methods::PROVIDER_MATCH, params)
            .await
        {
            Ok(result) => result.matches,
            Err(e) => {
                debug!(plugin = %self.name(), error = %e, "match failed");
                false
            }
        }
    }

    async fn parse(&self, cancel: &CancellationToken, input: &str) -> Result<String> {
        let params = ParseParams {
            input: input.to_string(),
        };
        let result: ParseResult = self.call(cancel, methods::PROVIDER_PARSE, params).await?;
        if !result.error.is_empty() {
            return Err(PluginError::Plugin {
                plugin: self.name().to_string(),
                message: format!("parse error: {}", result.error),
            });
        }
        Ok(result.id)
    }

    async fn fetch(&self, cancel: &CancellationToken, id: &str) -> Result<WorkUnit> {
        let params = FetchParams { id: id.to_string() };
        let result: WorkUnitResult = self.call(cancel, methods::PROVIDER_FETCH, params).await?;
        Ok(result.into())
    }

    async fn list(&self, cancel: &CancellationToken, options: &ListOptions) -> Result<Vec<WorkUnit>> {
        self.require(Capability::List)?;
        let params = ListParams {
            status: options.status.as_ref().map(|s| s.as_str().to_string()),
            labels: options.labels.clone(),
            assignee: options.assignee.clone(),
            limit: options.limit,
            offset: options.offset,
            options: options.options.clone(),
        };
        let results: Option<Vec<WorkUnitResult>> =
            self.call(cancel, methods::PROVIDER_LIST, params).await?;
        Ok(results
            .unwrap_or_default()
            .into_iter()
            .map(WorkUnit::from)
            .collect())
    }

    async fn add_comment(
        &self,
        cancel: &CancellationToken,
        work_unit_id: &str,
        body: &str,
    ) -> Result<Comment> {
        self.require(Capability::Comment)?;
        let params = AddCommentParams {
            work_unit_id: work_unit_id.to_string(),
            body: body.to_string(),
        };
        let result: CommentResult = self
            .call(cancel, methods::PROVIDER_ADD_COMMENT, params)
            .await?;
        Ok(result.into())
    }

    async fn update_status(
        &self,
        cancel: &CancellationToken,
        work_unit_id: &str,
        status: &Status,
    ) -> Result<()> {
        self.require(Capability::UpdateStatus)?;
        let params = UpdateStatusParams {
            work_unit_id: work_unit_id.to_string(),
            status: status.as_str().to_string(),
        };
        self.notify(cancel, methods::PROVIDER_UPDATE_STATUS, params)
            .await
    }

    async fn add_labels(
        &self,
        cancel: &CancellationToken,
        work_unit_id: &str,
        labels: &[String],
    ) -> Result<()> {
        self.require(Capability::ManageLabels)?;
        let params = LabelsParams {
            work_unit_id: work_unit_id.to_string(),
            labels: labels.to_vec(),
        };
        self.notify(cancel, methods::PROVIDER_ADD_LABELS, params).await
    }

    async fn remove_labels(
        &self,
        cancel: &CancellationToken,
        work_unit_id: &str,
        labels: &[String],
    ) -> Result<()> {
        self.require(Capability::ManageLabels)?;
        let params = LabelsParams {
            work_unit_id: work_unit_id.to_string(),
            labels: labels.to_vec(),
        };
        self.notify(cancel, methods::PROVIDER_REMOVE_LABELS, params)
            .await
    }

    async fn create_pull_request(
        &self,
        cancel: &CancellationToken,
        options: &PullRequestOptions,
    ) -> Result<PullRequest> {
        self.require(Capability::CreatePr)?;
        let params = CreatePrParams {
            work_unit_id: options.work_unit_id.clone(),
            title: options.title.clone(),
            description: options.body.clone(),
            source_branch: options.source_branch.clone(),
            target_branch: options.target_branch.clone(),
            draft: options.draft,
        };
        let result: PullRequestResult = self
            .call(cancel, methods::PROVIDER_CREATE_PR, params)
            .await?;
        Ok(PullRequest {
            id: result.id,
            number: result.number,
            url: result.url,
            state: result.state,
        })
    }

    async fn link_branch(
        &self,
        cancel: &CancellationToken,
        work_unit_id: &str,
        branch: &str,
    ) -> Result<()> {
        self.require(Capability::LinkBranch)?;
        let params = BranchParams {
            work_unit_id: work_unit_id.to_string(),
            branch: branch.to_string(),
        };
        self.notify(cancel, methods::PROVIDER_LINK_BRANCH, params).await
    }

    async fn unlink_branch(
        &self,
        cancel: &CancellationToken,
        work_unit_id: &str,
        branch: &str,
    ) -> Result<()> {
        self.require(Capability::LinkBranch)?;
        let params = BranchParams {
            work_unit_id: work_unit_id.to_string(),
            branch: branch.to_string(),
        };
        self.notify(cancel, methods::PROVIDER_UNLINK_BRANCH, params)
            .await
    }

    async fn get_linked_branch(&self, cancel: &CancellationToken, work_unit_id: &str) -> Result<String> {
        self.require(Capability::LinkBranch)?;
        let params = WorkUnitRef {
            work_unit_id: work_unit_id.to_string(),
        };
        let result: LinkedBranchResult = self
            .call(cancel, methods::PROVIDER_GET_LINKED_BRANCH, params)
            .await?;
        Ok(result.branch)
    }

    async fn download_attachment(
        &self,
        cancel: &CancellationToken,
        work_unit_id: &str,
        attachment_id: &str,
    ) -> Result<String> {
        self.require(Capability::DownloadAttachment)?;
        let params = AttachmentParams {
            work_unit_id: work_unit_id.to_string(),
            attachment_id: attachment_id.to_string(),
        };
        let result: AttachmentContentResult = self
            .call(cancel, methods::PROVIDER_DOWNLOAD_ATTACHMENT, params)
            .await?;
        Ok(result.content)
    }

    async fn snapshot(&self, cancel: &CancellationToken, id: &str) -> Result<Snapshot> {
        self.require(Capability::Snapshot)?;
        let params = SnapshotParams { id: id.to_string() };
        let result: SnapshotResult = self.call(cancel, methods::PROVIDER_SNAPSHOT, params).await?;
        Ok(Snapshot {
            reference: id.to_string(),
            content: result.content,
            metadata: result.metadata.unwrap_or_default(),
        })
    }

    async fn fetch_comments(&self, cancel: &CancellationToken, work_unit_id: &str) -> Result<Vec<Comment>> {
        self.require(Capability::FetchComments)?;
        let params = WorkUnitRef {
            work_unit_id: work_unit_id.to_string(),
        };
        let results: Option<Vec<CommentResult>> = self
            .call(cancel, methods::PROVIDER_FETCH_COMMENTS, params)
            .await?;
        Ok(results
            .unwrap_or_default()
            .into_iter()
            .map(Comment::from)
            .collect())
    }
}

// -- conversions --------------------------------------------------------------

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value.filter(|v| !v.is_empty())?;
    match DateTime::parse_from_rfc3339(value) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            debug!(value, error = %e, "ignoring malformed timestamp");
            None
        }
    }
}

impl From<PersonResult> for Person {
    fn from(p: PersonResult) -> Self {
        Self {
            id: p.id,
            name: p.name,
            email: p.email,
        }
    }
}

impl From<CommentResult> for Comment {
    fn from(c: CommentResult) -> Self {
        Self {
            created_at: parse_timestamp(c.created_at.as_deref()),
            id: c.id,
            body: c.body,
            author: c.author.map(Person::from).unwrap_or_default(),
        }
    }
}

impl From<AttachmentResult> for Attachment {
    fn from(a: AttachmentResult) -> Self {
        Self {
            id: a.id,
            name: a.name,
            url: a.url,
            content_type: a.mime_type,
            size: a.size,
        }
    }
}

impl From<WorkUnitResult> for WorkUnit {
    fn from(r: WorkUnitResult) -> Self {
        let source = r
            .source
            .map(|s| SourceInfo {
                kind: r.provider.clone(),
                reference: s.reference,
                url: s.url,
            })
            .unwrap_or_default();

        Self {
            created_at: parse_timestamp(r.created_at.as_deref()),
            updated_at: parse_timestamp(r.updated_at.as_deref()),
            status: Status::from(r.status.as_str()),
            priority: Priority::from_wire(r.priority),
            labels: r.labels.unwrap_or_default(),
            assignees: collect(r.assignees),
            comments: collect(r.comments),
            attachments: collect(r.attachments),
            subtasks: r.subtasks.unwrap_or_default(),
            metadata: r.metadata.unwrap_or_default(),
            source,
            id: r.id,
            external_id: r.external_id,
            provider: r.provider,
            title: r.title,
            description: r.description,
            external_key: r.external_key,
            task_type: r.task_type,
            slug: r.slug,
        }
    }
}

fn collect<T, U: From<T>>(items: Option<Vec<T>>) -> Vec<U> {
    items
        .unwrap_or_default()
        .into_iter()
        .map(U::from)
        .collect()
}
