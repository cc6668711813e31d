//! File-storage handlers backed by Google Drive.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Access, HandlerRegistry, IntentHandler, Services, require_credential};
use crate::auth::{Credential, CredentialStore};
use crate::error::HandlerError;
use crate::state::Outcome;
use crate::task::Task;

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";

/// Minimum similarity (0-100) for a file to count as the one the user meant.
const MATCH_CUTOFF: u32 = 75;

/// A file as listed by the storage provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
}

/// Third-party file storage, always called with the requesting user's credential.
#[async_trait]
pub trait DriveClient: Send + Sync {
    async fn list_files(&self, credential: &Credential) -> Result<Vec<DriveFile>, HandlerError>;

    async fn create_file(&self, credential: &Credential, name: &str)
    -> Result<DriveFile, HandlerError>;

    async fn delete_file(&self, credential: &Credential, id: &str) -> Result<(), HandlerError>;
}

/// Drive v3 REST client.
pub struct GoogleDrive {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

impl GoogleDrive {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DRIVE_API.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, HandlerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HandlerError::Drive(format!("{status}: {body}")))
    }
}

impl Default for GoogleDrive {
    fn default() -> Self {
        Self::new()
    }
}

fn http_err(e: reqwest::Error) -> HandlerError {
    HandlerError::Drive(e.to_string())
}

#[async_trait]
impl DriveClient for GoogleDrive {
    async fn list_files(&self, credential: &Credential) -> Result<Vec<DriveFile>, HandlerError> {
        let response = self
            .http
            .get(format!("{}/files", self.base_url))
            .bearer_auth(credential.access_token())
            .query(&[("fields", "files(id,name)"), ("pageSize", "100")])
            .send()
            .await
            .map_err(http_err)?;
        let list: FileList = Self::checked(response).await?.json().await.map_err(http_err)?;
        Ok(list.files)
    }

    async fn create_file(
        &self,
        credential: &Credential,
        name: &str,
    ) -> Result<DriveFile, HandlerError> {
        let response = self
            .http
            .post(format!("{}/files", self.base_url))
            .bearer_auth(credential.access_token())
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(http_err)?;
        Self::checked(response).await?.json().await.map_err(http_err)
    }

    async fn delete_file(&self, credential: &Credential, id: &str) -> Result<(), HandlerError> {
        let response = self
            .http
            .delete(format!("{}/files/{id}", self.base_url))
            .bearer_auth(credential.access_token())
            .send()
            .await
            .map_err(http_err)?;
        Self::checked(response).await?;
        Ok(())
    }
}

pub(super) fn register(registry: &mut HandlerRegistry, services: &Services) {
    let ops = [
        DriveOp::List,
        DriveOp::View,
        DriveOp::Create,
        DriveOp::Delete,
    ];
    for op in ops {
        registry.register(Arc::new(DriveHandler {
            op,
            credentials: services.credentials.clone(),
            drive: services.drive.clone(),
        }));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOp {
    List,
    View,
    Create,
    Delete,
}

/// One drive intent. All of them act on the requesting user's drive.
pub struct DriveHandler {
    op: DriveOp,
    credentials: Arc<CredentialStore>,
    drive: Arc<dyn DriveClient>,
}

impl DriveHandler {
    pub fn new(op: DriveOp, credentials: Arc<CredentialStore>, drive: Arc<dyn DriveClient>) -> Self {
        Self {
            op,
            credentials,
            drive,
        }
    }

    async fn run(&self, task: &Task, credential: &Credential) -> Result<String, HandlerError> {
        match self.op {
            DriveOp::List => {
                let files = self.drive.list_files(credential).await?;
                if files.is_empty() {
                    return Ok("No files in this drive".to_string());
                }
                let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
                Ok(format!("```{}\n```", names.join("\n")))
            }
            DriveOp::View => {
                let Some(wanted) = file_name(task) else {
                    return Ok(UNKNOWN_FILE.to_string());
                };
                let files = self.drive.list_files(credential).await?;
                Ok(match best_match(wanted, &files) {
                    Some(file) => format!("```File ID: {}```", file.id),
                    None => NOT_FOUND.to_string(),
                })
            }
            DriveOp::Create => {
                let Some(name) = file_name(task) else {
                    return Ok(UNKNOWN_FILE.to_string());
                };
                let file = self.drive.create_file(credential, name).await?;
                tracing::info!(file_id = %file.id, "Created drive file");
                Ok(format!("Created file '{name}'"))
            }
            DriveOp::Delete => {
                let Some(wanted) = file_name(task) else {
                    return Ok(UNKNOWN_FILE.to_string());
                };
                let files = self.drive.list_files(credential).await?;
                let Some(file) = best_match(wanted, &files) else {
                    return Ok(NOT_FOUND.to_string());
                };
                match self.drive.delete_file(credential, &file.id).await {
                    Ok(()) => Ok(format!("{} deleted", file.name)),
                    Err(e) => {
                        tracing::warn!(file_id = %file.id, error = %e, "Drive delete failed");
                        Ok("I can't delete that file".to_string())
                    }
                }
            }
        }
    }
}

const UNKNOWN_FILE: &str = "I don't know what file you're talking about";
const NOT_FOUND: &str = "No file found with that name, sorry";

#[async_trait]
impl IntentHandler for DriveHandler {
    fn intent(&self) -> &str {
        match self.op {
            DriveOp::List => "get-drive-list",
            DriveOp::View => "view-drive-file",
            DriveOp::Create => "create-drive-file",
            DriveOp::Delete => "delete-drive-file",
        }
    }

    fn example(&self) -> &str {
        match self.op {
            DriveOp::List => "What is in your google drive?",
            DriveOp::View => "show getting started",
            DriveOp::Create => "create filename",
            DriveOp::Delete => "delete filename",
        }
    }

    fn per_user_credentials(&self) -> bool {
        true
    }

    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let credential = match require_credential(&self.credentials, task).await? {
            Access::Granted(credential) => credential,
            Access::Suspended(outcome) => return Ok(outcome),
        };

        let channel = &task.event().channel_id;
        match self.run(task, &credential).await {
            Ok(reply) => task.output().send(channel, reply).await?,
            Err(e) => {
                task.output().send_error(channel, &e).await?;
                return Err(e);
            }
        }
        Ok(Outcome::Done)
    }
}

/// File name the user referred to. Older classifier models tag it as a
/// `randomize_option`.
fn file_name(task: &Task) -> Option<&str> {
    let entities = task.entities();
    entities
        .best_value("file_name")
        .or_else(|| entities.best_value("randomize_option"))
}

/// Closest file by name, if any scores at least [`MATCH_CUTOFF`].
fn best_match<'a>(wanted: &str, files: &'a [DriveFile]) -> Option<&'a DriveFile> {
    let wanted = wanted.to_lowercase();
    files
        .iter()
        .map(|f| (similarity(&wanted, &f.name.to_lowercase()), f))
        .filter(|(score, _)| *score >= MATCH_CUTOFF)
        .fold(None::<(u32, &DriveFile)>, |best, candidate| match best {
            Some(b) if b.0 >= candidate.0 => Some(b),
            _ => Some(candidate),
        })
        .map(|(_, f)| f)
}

/// Similarity in percent: exact 100, containment 90, otherwise normalized
/// edit distance.
fn similarity(a: &str, b: &str) -> u32 {
    if a == b {
        return 100;
    }
    if !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a)) {
        return 90;
    }
    (strsim::normalized_levenshtein(a, b) * 100.0).floor() as u32
}
