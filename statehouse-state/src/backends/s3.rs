//! S3 backend for state storage
//!
//! The default state is stored at `key`. Named states are stored at
//! `<workspace_key_prefix>/<name>/<key>`, and every state object has a sibling
//! `<state key>.lock` object. Locks are created with `If-None-Match: *`, so S3
//! itself rejects a second writer, and expired or released locks are deleted with
//! `If-Match` on the ETag that was checked.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketVersioningStatus, PublicAccessBlockConfiguration, ServerSideEncryption,
    VersioningConfiguration,
};

use crate::backend::{
    Backend, BackendConfig, BackendError, BackendResult, DEFAULT_STATE_NAME, Locker, StateManager,
    validate_state_name,
};
use crate::client::{ClientStateManager, StateClient};
use crate::lock::{LockInfo, check_existing, check_holder};
use crate::state::StateFile;

/// Default prefix for named state keys
pub const DEFAULT_WORKSPACE_KEY_PREFIX: &str = "env:";

/// S3-based state backend
pub struct S3Backend {
    /// S3 client
    client: Client,
    /// Bucket name
    bucket: String,
    /// Object key for the default state file
    key: String,
    /// Prefix under which named states are stored
    workspace_key_prefix: String,
    /// AWS region
    region: String,
    /// Whether to encrypt the state file (default: true)
    encrypt: bool,
    /// Whether to auto-create the bucket if it doesn't exist (default: true)
    auto_create: bool,
}

impl S3Backend {
    /// Create a new S3Backend from configuration
    pub async fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let bucket = config
            .get_string("bucket")
            .ok_or_else(|| BackendError::configuration("Missing required attribute: bucket"))?
            .to_string();

        let key = config
            .get_string("key")
            .ok_or_else(|| BackendError::configuration("Missing required attribute: key"))?
            .to_string();

        let region_value = config
            .get_string("region")
            .ok_or_else(|| BackendError::configuration("Missing required attribute: region"))?;

        let workspace_key_prefix = config
            .get_string("workspace_key_prefix")
            .unwrap_or(DEFAULT_WORKSPACE_KEY_PREFIX)
            .trim_end_matches('/')
            .to_string();
        if workspace_key_prefix.is_empty() {
            return Err(BackendError::configuration(
                "workspace_key_prefix must not be empty",
            ));
        }

        // Convert region from DSL format (aws.Region.ap_northeast_1) to AWS format (ap-northeast-1)
        let region = convert_region_value(region_value);

        let encrypt = config.get_bool_or("encrypt", true);
        let auto_create = config.get_bool_or("auto_create", true);

        // Load AWS config with the specified region
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.clone()))
            .load()
            .await;

        let client = Client::new(&aws_config);

        Ok(Self {
            client,
            bucket,
            key,
            workspace_key_prefix,
            region,
            encrypt,
            auto_create,
        })
    }

    /// Object key holding the named state
    fn state_key(&self, name: &str) -> String {
        state_key(&self.workspace_key_prefix, &self.key, name)
    }

    fn state_client(&self, name: &str) -> S3Client {
        S3Client {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: self.state_key(name),
            encrypt: self.encrypt,
        }
    }

    /// Get the bucket name
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    /// Get whether auto_create is enabled
    pub fn auto_create_enabled(&self) -> bool {
        self.auto_create
    }

    /// Check if the backend storage (bucket) exists
    pub async fn bucket_exists(&self) -> BackendResult<bool> {
        let result = self.client.head_bucket().bucket(&self.bucket).send().await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                // HeadBucket returns 404 for non-existent buckets
                if err.as_service_error().is_some() || status_code(&err) == Some(404) {
                    Ok(false)
                } else {
                    Err(BackendError::Aws(err.to_string()))
                }
            }
        }
    }

    /// Create the backend storage (bucket) with appropriate settings
    ///
    /// This creates the bucket with:
    /// - Versioning enabled (for state history)
    /// - Public access blocked
    pub async fn create_bucket(&self) -> BackendResult<()> {
        // Create bucket with location constraint if not us-east-1
        let mut create_request = self.client.create_bucket().bucket(&self.bucket);

        if self.region != "us-east-1" {
            use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};

            let constraint = BucketLocationConstraint::from(self.region.as_str());
            let config = CreateBucketConfiguration::builder()
                .location_constraint(constraint)
                .build();
            create_request = create_request.create_bucket_configuration(config);
        }

        create_request
            .send()
            .await
            .map_err(|e| BackendError::BucketCreationFailed(e.to_string()))?;

        let versioning_config = VersioningConfiguration::builder()
            .status(BucketVersioningStatus::Enabled)
            .build();

        self.client
            .put_bucket_versioning()
            .bucket(&self.bucket)
            .versioning_configuration(versioning_config)
            .send()
            .await
            .map_err(|e| BackendError::Aws(format!("Failed to enable versioning: {}", e)))?;

        let public_access_block = PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .block_public_policy(true)
            .ignore_public_acls(true)
            .restrict_public_buckets(true)
            .build();

        self.client
            .put_public_access_block()
            .bucket(&self.bucket)
            .public_access_block_configuration(public_access_block)
            .send()
            .await
            .map_err(|e| BackendError::Aws(format!("Failed to block public access: {}", e)))?;

        log::info!("Created state bucket {} in {}", self.bucket, self.region);
        Ok(())
    }
}

#[async_trait]
impl Backend for S3Backend {
    async fn states(&self) -> BackendResult<Vec<String>> {
        let prefix = format!("{}/", self.workspace_key_prefix);
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| BackendError::Aws(e.to_string()))?;

            for object in output.contents() {
                if let Some(name) = object
                    .key()
                    .and_then(|key| state_name_from_key(&self.workspace_key_prefix, &self.key, key))
                    && name != DEFAULT_STATE_NAME
                {
                    names.push(name);
                }
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated() == Some(true) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        names.sort();
        names.dedup();
        names.insert(0, DEFAULT_STATE_NAME.to_string());
        Ok(names)
    }

    async fn state(&self, name: &str) -> BackendResult<Box<dyn StateManager>> {
        validate_state_name(name)?;

        let client = self.state_client(name);
        if name != DEFAULT_STATE_NAME {
            client.create_if_missing().await?;
        }

        Ok(Box::new(ClientStateManager::new(name, client)))
    }

    async fn delete_state(&self, name: &str) -> BackendResult<()> {
        if name == DEFAULT_STATE_NAME {
            return Err(BackendError::DefaultStateDeletion);
        }
        validate_state_name(name)?;

        let client = self.state_client(name);
        if client.get().await?.is_none() {
            return Err(BackendError::StateNotFound(name.to_string()));
        }

        client.delete().await
    }

    async fn init(&self) -> BackendResult<()> {
        if !self.bucket_exists().await? {
            if self.auto_create {
                self.create_bucket().await?;
            } else {
                return Err(BackendError::BucketNotFound(self.bucket.clone()));
            }
        }

        // Initialize empty state if none exists
        self.state_client(DEFAULT_STATE_NAME)
            .create_if_missing()
            .await
    }
}

/// Storage client for one state object and its lock object
pub struct S3Client {
    client: Client,
    bucket: String,
    key: String,
    encrypt: bool,
}

impl S3Client {
    /// Get the lock file key (state key + ".lock")
    fn lock_key(&self) -> String {
        format!("{}.lock", self.key)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> BackendResult<Option<T>> {
        match self.fetch(key).await? {
            Some(object) => parse_json(key, &object.body).map(Some),
            None => Ok(None),
        }
    }

    /// Put an object, optionally only if the key does not exist yet
    ///
    /// Returns `Ok(false)` when `only_if_absent` is set and the object exists.
    async fn put_bytes(
        &self,
        key: &str,
        body: Vec<u8>,
        only_if_absent: bool,
    ) -> BackendResult<bool> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json");

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }
        if only_if_absent {
            request = request.if_none_match("*");
        }

        match request.send().await {
            Ok(_) => Ok(true),
            // 412 Precondition Failed, or 409 when a concurrent conditional write wins
            Err(err) if only_if_absent && matches!(status_code(&err), Some(409 | 412)) => Ok(false),
            Err(err) => Err(BackendError::Aws(err.to_string())),
        }
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BackendError::Aws(e.to_string()))?;

        Ok(())
    }

    async fn create_if_missing(&self) -> BackendResult<()> {
        if self.put_bytes(&self.key, to_json(&StateFile::new())?, true).await? {
            log::debug!("Initialized empty state at s3://{}/{}", self.bucket, self.key);
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for S3Client {
    async fn fetch(&self, key: &str) -> BackendResult<Option<TaggedObject>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string);
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| BackendError::Io(e.to_string()))?;
                Ok(Some(TaggedObject {
                    body: body.into_bytes().to_vec(),
                    etag,
                }))
            }
            Err(err) if status_code(&err) == Some(404) => Ok(None),
            Err(err) => Err(BackendError::Aws(err.to_string())),
        }
    }

    async fn create(&self, key: &str, body: Vec<u8>) -> BackendResult<bool> {
        self.put_bytes(key, body, true).await
    }

    async fn delete_if_match(&self, key: &str, etag: &str) -> BackendResult<bool> {
        let result = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .if_match(etag)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => match status_code(&err) {
                Some(412) => Ok(false),
                // Already gone
                Some(404) => Ok(true),
                _ => Err(BackendError::Aws(err.to_string())),
            },
        }
    }
}

#[async_trait]
impl StateClient for S3Client {
    async fn get(&self) -> BackendResult<Option<StateFile>> {
        self.get_json(&self.key).await
    }

    async fn put(&self, state: &StateFile) -> BackendResult<()> {
        self.put_bytes(&self.key, to_json(state)?, false).await?;
        log::debug!("Wrote state s3://{}/{}", self.bucket, self.key);
        Ok(())
    }

    /// Remove the state object and its lock object
    async fn delete(&self) -> BackendResult<()> {
        self.delete_object(&self.key).await?;
        self.delete_object(&self.lock_key()).await
    }

    fn as_locker(&self) -> Option<&dyn Locker> {
        Some(self)
    }
}

#[async_trait]
impl Locker for S3Client {
    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        let lock_id = acquire_lock(self, &self.lock_key(), info).await?;
        log::info!("Acquired lock {} on s3://{}/{}", lock_id, self.bucket, self.key);
        Ok(lock_id)
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        release_lock(self, &self.lock_key(), lock_id, false).await?;
        log::info!("Released lock {} on s3://{}/{}", lock_id, self.bucket, self.key);
        Ok(())
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        log::warn!("Force unlocking lock {} on s3://{}/{}", lock_id, self.bucket, self.key);
        release_lock(self, &self.lock_key(), lock_id, true).await
    }
}

/// An object body together with its entity tag
struct TaggedObject {
    body: Vec<u8>,
    etag: Option<String>,
}

/// Conditional object operations the lock protocol is built on
#[async_trait]
trait LockStore: Send + Sync {
    async fn fetch(&self, key: &str) -> BackendResult<Option<TaggedObject>>;

    /// Write only if the key does not exist; `Ok(false)` when it does
    async fn create(&self, key: &str, body: Vec<u8>) -> BackendResult<bool>;

    /// Delete only if the object still has `etag`; `Ok(false)` when it was replaced
    async fn delete_if_match(&self, key: &str, etag: &str) -> BackendResult<bool>;
}

/// Acquire the lock object at `key`
///
/// An expired lock is removed with `If-Match` on the ETag that was read, so of
/// several clients taking over the same stale lock at most one deletes it, and
/// the conditional create decides which of them ends up holding the lock.
async fn acquire_lock(
    store: &dyn LockStore,
    key: &str,
    info: &LockInfo,
) -> BackendResult<String> {
    let lock = info.issue();
    let body = to_json(&lock)?;

    if store.create(key, body.clone()).await? {
        return Ok(lock.id);
    }

    if let Some(object) = store.fetch(key).await? {
        let existing: LockInfo = parse_json(key, &object.body)?;
        check_existing(&existing)?;

        let Some(etag) = object.etag.as_deref() else {
            return Err(BackendError::locked(&existing));
        };
        if !store.delete_if_match(key, etag).await? {
            return Err(held_by_other(store, key).await);
        }
    }

    if !store.create(key, body).await? {
        return Err(held_by_other(store, key).await);
    }
    Ok(lock.id)
}

/// Release the lock object at `key` if `lock_id` is the holder
///
/// With `force`, a lock object that cannot be parsed is removed as well.
async fn release_lock(
    store: &dyn LockStore,
    key: &str,
    lock_id: &str,
    force: bool,
) -> BackendResult<()> {
    let Some(object) = store.fetch(key).await? else {
        return Err(BackendError::LockNotFound(lock_id.to_string()));
    };

    match parse_json::<LockInfo>(key, &object.body) {
        Ok(existing) => check_holder(Some(&existing), lock_id)?,
        Err(e) if force => log::warn!("Removing unreadable lock {}: {}", key, e),
        Err(e) => return Err(e),
    }

    // S3 always returns an ETag; "*" only requires the object to exist
    let etag = object.etag.as_deref().unwrap_or("*");
    if !store.delete_if_match(key, etag).await? {
        return Err(held_by_other(store, key).await);
    }
    Ok(())
}

/// Report the current holder of a lock we failed to take
async fn held_by_other(store: &dyn LockStore, key: &str) -> BackendError {
    let object = match store.fetch(key).await {
        Ok(object) => object,
        Err(err) => return err,
    };
    match object.map(|o| parse_json::<LockInfo>(key, &o.body)) {
        Some(Ok(existing)) => BackendError::locked(&existing),
        _ => BackendError::Locked {
            lock_id: String::new(),
            who: "unknown".to_string(),
            operation: "unknown".to_string(),
        },
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> BackendResult<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| BackendError::Serialization(e.to_string()))
}

fn parse_json<T: serde::de::DeserializeOwned>(key: &str, body: &[u8]) -> BackendResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| BackendError::InvalidState(format!("{}: {}", key, e)))
}

/// Object key holding a named state
fn state_key(prefix: &str, key: &str, name: &str) -> String {
    if name == DEFAULT_STATE_NAME {
        key.to_string()
    } else {
        format!("{}/{}/{}", prefix, name, key)
    }
}

/// Recover the state name from an object key under the workspace prefix
fn state_name_from_key(prefix: &str, key: &str, object_key: &str) -> Option<String> {
    let rest = object_key.strip_prefix(prefix)?.strip_prefix('/')?;
    let (name, state_key) = rest.split_once('/')?;
    (state_key == key && !name.is_empty()).then(|| name.to_string())
}

/// Convert region value from DSL format to AWS format
/// e.g., "aws.Region.ap_northeast_1" -> "ap-northeast-1"
fn convert_region_value(value: &str) -> String {
    match value.strip_prefix("aws.Region.") {
        Some(region) => region.replace('_', "-"),
        None => value.to_string(),
    }
}

/// HTTP status of a failed S3 call, if a response was received
fn status_code<E>(err: &aws_sdk_s3::error::SdkError<E>) -> Option<u16> {
    err.raw_response().map(|raw| raw.status().as_u16())
}
