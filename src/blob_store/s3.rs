/// S3-compatible blob storage backend
use crate::blob_store::{
    cancellable, BlobBackend, BlobError, BlobReader, BlobResult, BlobSource,
    BlobStat, SaveOptions, SavedBlob,
};
use crate::stream::{HashingReader, COPY_BUFFER_SIZE};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempts made for a spool upload before giving up
const SPOOL_UPLOAD_ATTEMPTS: usize = 3;

/// S3 blob storage backend
///
/// Supports AWS S3 and S3-compatible storage providers (MinIO, Garage, etc.).
/// Endpoint, region and credentials come from the ambient AWS environment.
#[derive(Clone)]
pub struct S3BlobBackend {
    client: Arc<Client>,
    bucket: String,
    prefix: String,
}

/// Configuration for S3 storage
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,

    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`
    pub use_path_style: bool,

    /// Prefix for all object keys, e.g. `trove/`
    pub prefix: String,
}

impl S3BlobBackend {
    /// Create a new S3 blob backend
    pub async fn new(config: S3Config) -> BlobResult<Self> {
        if config.bucket.is_empty() {
            return Err(BlobError::Internal("S3 bucket name is required".to_string()));
        }

        info!(
            "Initializing S3 blob storage (bucket: {}, path style: {})",
            config.bucket, config.use_path_style
        );

        let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let s3_config = S3ConfigBuilder::from(&aws_config)
            .force_path_style(config.use_path_style)
            .build();

        Ok(Self {
            client: Arc::new(Client::from_conf(s3_config)),
            bucket: config.bucket,
            prefix: normalize_prefix(&config.prefix),
        })
    }

    /// Object key for a storage key
    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Stream `reader` into `object_key`, in 8 MiB parts
    ///
    /// A payload that fits in one part goes up as a single PutObject;
    /// anything larger becomes a multipart upload which is aborted on error
    /// or cancellation.
    async fn upload<R>(
        &self,
        object_key: &str,
        reader: &mut HashingReader<R>,
        content_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> BlobResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut part = Vec::with_capacity(COPY_BUFFER_SIZE);
        cancellable(cancel, async {
            fill_part(reader, &mut part)
                .await
                .map_err(|e| BlobError::from_io(object_key, e))
        })
        .await?;

        if part.len() < COPY_BUFFER_SIZE {
            debug!("Uploading {} ({} bytes) in one request", object_key, part.len());
            cancellable(cancel, async {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(object_key)
                    .set_content_type(content_type.map(str::to_string))
                    .content_length(part.len() as i64)
                    .body(ByteStream::from(part))
                    .send()
                    .await
                    .map_err(|e| classify("PutObject", object_key, e))
            })
            .await?;
            return Ok(());
        }

        let created = cancellable(cancel, async {
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(object_key)
                .set_content_type(content_type.map(str::to_string))
                .send()
                .await
                .map_err(|e| classify("CreateMultipartUpload", object_key, e))
        })
        .await?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BlobError::Internal("S3 returned no multipart upload id".to_string()))?
            .to_string();

        finish_or_abort(
            cancel,
            self.upload_parts(object_key, &upload_id, reader, part),
            || self.abort_multipart(object_key, &upload_id),
        )
        .await
    }

    async fn abort_multipart(&self, object_key: &str, upload_id: &str) -> BlobResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify("AbortMultipartUpload", object_key, e))?;
        debug!("Aborted multipart upload {} for {}", upload_id, object_key);
        Ok(())
    }

    async fn upload_parts<R>(
        &self,
        object_key: &str,
        upload_id: &str,
        reader: &mut HashingReader<R>,
        first: Vec<u8>,
    ) -> BlobResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut completed = Vec::new();
        let mut part = first;
        let mut part_number: i32 = 1;

        loop {
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(object_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_length(part.len() as i64)
                .body(ByteStream::from(std::mem::take(&mut part)))
                .send()
                .await
                .map_err(|e| classify("UploadPart", object_key, e))?;

            completed.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );

            fill_part(reader, &mut part)
                .await
                .map_err(|e| BlobError::from_io(object_key, e))?;
            if part.is_empty() {
                break;
            }
            part_number += 1;
        }

        debug!("Completing {} with {} parts", object_key, completed.len());
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("CompleteMultipartUpload", object_key, e))?;

        Ok(())
    }
}

/// Drive the part uploads of a multipart upload
///
/// If they fail, or `cancel` fires first, the upload is aborted so the
/// bucket does not keep the parts around.
async fn finish_or_abort<P, A, AFut>(cancel: &CancellationToken, parts: P, abort: A) -> BlobResult<()>
where
    P: Future<Output = BlobResult<()>>,
    A: FnOnce() -> AFut,
    AFut: Future<Output = BlobResult<()>>,
{
    let result = cancellable(cancel, parts).await;
    if let Err(cause) = &result {
        if let Err(e) = abort().await {
            warn!("Failed to abort multipart upload after {}: {}", cause, e);
        }
    }
    result
}

/// One try at sending a spool file to its object
#[async_trait]
trait SpoolSink: Sync {
    /// Where the bytes go, for logs
    fn target(&self) -> &str;

    async fn send(&self, reader: &mut HashingReader<File>) -> BlobResult<()>;
}

struct ObjectSink<'a> {
    backend: &'a S3BlobBackend,
    object_key: &'a str,
    content_type: Option<&'a str>,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl SpoolSink for ObjectSink<'_> {
    fn target(&self) -> &str {
        self.object_key
    }

    async fn send(&self, reader: &mut HashingReader<File>) -> BlobResult<()> {
        self.backend
            .upload(self.object_key, reader, self.content_type, self.cancel)
            .await
    }
}

/// Send a spool, rewinding and retrying transient failures
///
/// Seeking to zero also resets the digest and byte counter, so after a
/// success they describe the whole file. Returns the attempts made.
async fn send_spool_with_retry<S>(
    sink: &S,
    reader: &mut HashingReader<File>,
    max_attempts: usize,
) -> BlobResult<usize>
where
    S: SpoolSink + ?Sized,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        if attempt > 1 {
            reader
                .rewind()
                .await
                .map_err(|e| BlobError::Internal(format!("rewind spool: {}", e)))?;
        }

        match sink.send(reader).await {
            Ok(()) => return Ok(attempt),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(
                    "Upload of {} failed (attempt {}/{}), retrying: {}",
                    sink.target(),
                    attempt,
                    max_attempts,
                    e
                );
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read up to one part into `part`, replacing its contents
async fn fill_part<R>(reader: &mut R, part: &mut Vec<u8>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    part.clear();
    (&mut *reader)
        .take(COPY_BUFFER_SIZE as u64)
        .read_to_end(part)
        .await?;
    Ok(())
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Map an SDK error onto the backend taxonomy
fn classify<E>(operation: &str, object_key: &str, err: SdkError<E, HttpResponse>) -> BlobError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .map(str::to_string);
    let detail = format!("S3 {} {}: {}", operation, object_key, DisplayErrorContext(&err));

    match (status, code.as_deref()) {
        (Some(404), _) | (_, Some("NoSuchKey" | "NotFound")) => {
            BlobError::NotFound(object_key.to_string())
        }
        (Some(401 | 403), _) | (_, Some("AccessDenied" | "InvalidAccessKeyId")) => {
            BlobError::Denied(detail)
        }
        (Some(s), _) if s >= 500 => BlobError::Unavailable(detail),
        _ => match err {
            SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
                BlobError::Unavailable(detail)
            }
            _ => BlobError::Internal(detail),
        },
    }
}

#[async_trait]
impl BlobBackend for S3BlobBackend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn save(
        &self,
        reader: BlobSource<'_>,
        opts: &SaveOptions,
        cancel: &CancellationToken,
    ) -> BlobResult<SavedBlob> {
        let key = opts.storage_key();
        let object_key = self.object_key(&key);
        let mut hashing = HashingReader::new(reader);

        self.upload(&object_key, &mut hashing, opts.content_type.as_deref(), cancel)
            .await?;

        debug!("✓ Blob uploaded to S3: {}", object_key);
        Ok(SavedBlob {
            key,
            digest: hashing.final_sum(),
            size: hashing.bytes_read(),
        })
    }

    async fn save_spool(
        &self,
        spool: &Path,
        opts: &SaveOptions,
        cancel: &CancellationToken,
    ) -> BlobResult<SavedBlob> {
        let key = opts.storage_key();
        let object_key = self.object_key(&key);

        let file = File::open(spool)
            .await
            .map_err(|e| BlobError::Internal(format!("open spool {}: {}", spool.display(), e)))?;
        let mut hashing = HashingReader::new(file);

        let sink = ObjectSink {
            backend: self,
            object_key: &object_key,
            content_type: opts.content_type.as_deref(),
            cancel,
        };
        let attempt = send_spool_with_retry(&sink, &mut hashing, SPOOL_UPLOAD_ATTEMPTS).await?;

        if let Some(expected) = &opts.expected_digest {
            if *expected != hashing.final_sum() {
                // Spool changed under us; do not keep a blob with the wrong digest
                if let Err(e) = self.delete(&key, &CancellationToken::new()).await {
                    warn!("Failed to delete mismatched upload {}: {}", object_key, e);
                }
                return Err(BlobError::Internal(format!(
                    "digest mismatch while uploading spool {}",
                    spool.display()
                )));
            }
        }

        debug!("✓ Spool uploaded to S3: {} (attempts: {})", object_key, attempt);
        Ok(SavedBlob {
            key,
            digest: hashing.final_sum(),
            size: hashing.bytes_read(),
        })
    }

    async fn open(&self, key: &str, cancel: &CancellationToken) -> BlobResult<BlobReader> {
        let object_key = self.object_key(key);

        let output = cancellable(cancel, async {
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(&object_key)
                .send()
                .await
                .map_err(|e| classify("GetObject", &object_key, e))
        })
        .await
        .map_err(|e| match e {
            BlobError::NotFound(_) => BlobError::NotFound(key.to_string()),
            other => other,
        })?;

        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> BlobResult<()> {
        let object_key = self.object_key(key);

        let result = cancellable(cancel, async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&object_key)
                .send()
                .await
                .map_err(|e| classify("DeleteObject", &object_key, e))
        })
        .await;

        match result {
            Ok(_) | Err(BlobError::NotFound(_)) => {
                debug!("✓ Blob deleted from S3: {}", object_key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> BlobResult<BlobStat> {
        let object_key = self.object_key(key);

        let head = cancellable(cancel, async {
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(&object_key)
                .send()
                .await
                .map_err(|e| classify("HeadObject", &object_key, e))
        })
        .await
        .map_err(|e| match e {
            BlobError::NotFound(_) => BlobError::NotFound(key.to_string()),
            other => other,
        })?;

        let modified_at = head
            .last_modified()
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
            .unwrap_or_else(Utc::now);

        Ok(BlobStat {
            key: key.to_string(),
            size: head.content_length().unwrap_or(0).max(0) as u64,
            modified_at,
        })
    }

    async fn health(&self, cancel: &CancellationToken) -> BlobResult<()> {
        cancellable(cancel, async {
            self.client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .max_keys(1)
                .send()
                .await
                .map_err(|e| classify("ListObjectsV2", &self.bucket, e))
        })
        .await?;
        Ok(())
    }
}
