//! S3 backend over `aws-sdk-s3`

use super::{MultipartUpload, ObjectStorage};
use crate::error::{Error, Result};
use crate::template::{self, TemplateContext};
use crate::types::OptionStringExt;
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, info, instrument};

/// Service error codes that no retry can fix
const FATAL_CODES: [&str; 9] = [
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "InvalidToken",
    "NoSuchBucket",
    "InvalidBucketName",
    "InvalidArgument",
    "BucketAlreadyExists",
];

/// Region S3 creates buckets in without a location constraint
const DEFAULT_REGION: &str = "us-east-1";

/// Classify an SDK error as transient or fatal
fn storage_error<E, R>(operation: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let fatal = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            false
        }
        SdkError::ServiceError(service) => service
            .err()
            .code()
            .is_some_and(|code| FATAL_CODES.contains(&code)),
        _ => true,
    };

    let message = format!("{operation} failed: {}", DisplayErrorContext(err));
    if fatal {
        Error::storage_fatal(message)
    } else {
        Error::storage(message)
    }
}

/// S3 or S3-compatible object storage
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    /// Build a client
    ///
    /// Static keys (templates allowed) take precedence; otherwise the default
    /// AWS credential chain is used.
    pub async fn connect(
        region: &str,
        endpoint: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        path_style: bool,
    ) -> Result<Self> {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(path_style);

        if let Some(endpoint) = endpoint.none_if_empty() {
            builder = builder.endpoint_url(endpoint);
        }

        let ctx = TemplateContext::new();
        if let (Some(key_id), Some(secret)) = (
            access_key_id.none_if_empty(),
            secret_access_key.none_if_empty(),
        ) {
            let credentials = Credentials::new(
                template::render(&key_id, &ctx)?,
                template::render(&secret, &ctx)?,
                None,
                None,
                "chariot-config",
            );
            builder = builder.credentials_provider(credentials);
        }

        info!(region, "S3 client initialized");
        Ok(Self {
            client: Client::from_conf(builder.build()),
        })
    }

    /// Wrap an existing client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    #[instrument(skip(self))]
    async fn ensure_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        if self.client.head_bucket().bucket(bucket).send().await.is_ok() {
            debug!("Bucket s3://{} already exists", bucket);
            return Ok(());
        }

        let mut request = self.client.create_bucket().bucket(bucket);
        if region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!("Created bucket s3://{} in {}", bucket, region);
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(e) => Err(storage_error("CreateBucket", e)),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| storage_error("ListObjectsV2", e))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(storage_error("HeadObject", e)),
        }
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| storage_error("PutObject", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("DeleteObject", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_multipart(&self, bucket: &str, key: &str) -> Result<Box<dyn MultipartUpload>> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("CreateMultipartUpload", e))?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| Error::storage("CreateMultipartUpload returned no upload id"))?
            .to_string();

        Ok(Box::new(S3Multipart {
            client: self.client.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
        }))
    }

    fn uri(&self, bucket: &str, key: &str) -> String {
        format!("s3://{bucket}/{key}")
    }
}

/// Multipart upload in progress on S3
struct S3Multipart {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
}

#[async_trait]
impl MultipartUpload for S3Multipart {
    async fn put_part(&mut self, part_number: u32, data: Bytes) -> Result<()> {
        let part_number = i32::try_from(part_number)
            .map_err(|_| Error::storage_fatal(format!("Part number {part_number} out of range")))?;

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| storage_error("UploadPart", e))?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(response.e_tag().map(str::to_string))
                .build(),
        );
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        let mut parts = self.parts.clone();
        parts.sort_by_key(CompletedPart::part_number);

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| storage_error("CompleteMultipartUpload", e))?;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| storage_error("AbortMultipartUpload", e))?;
        Ok(())
    }
}
