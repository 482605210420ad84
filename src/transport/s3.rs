/*!
 * S3-compatible transport over `aws-sdk-s3`
 *
 * Request signing, retries of individual HTTP calls and connection reuse are
 * handled by the SDK. This module only maps the transfer engine's operations
 * onto SDK calls and folds SDK errors into [`TransportError`].
 *
 * S3 reports CRC-64/NVME, not the CRC-64/ECMA variant the engine combines, so
 * `crc64` is always `None` and end-to-end CRC verification is skipped.
 */

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream;
use std::ops::Range;
use tracing::debug;

use super::{
    BodyStream, CommitResult, ListedPart, ObjectLocation, ObjectMeta, PartTag, Transport,
    TransportError, TransportResult, UploadedPart,
};

/// [`Transport`] backed by an S3 client
#[derive(Debug, Clone)]
pub struct S3Transport {
    client: Client,
}

impl S3Transport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the standard AWS environment (profile, env vars, IMDS)
    pub async fn from_env() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::new(Client::new(&config))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn map_sdk_error<E>(target: &str, error: SdkError<E>) -> TransportError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match &error {
        SdkError::TimeoutError(_) => TransportError::Timeout(format!("{}: {:?}", target, error)),
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            TransportError::Network(format!("{}: {:?}", target, error))
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or("Unknown").to_string();
            let message = ctx.err().message().unwrap_or_default().to_string();
            let request_id = ctx.raw().headers().get("x-amz-request-id").map(str::to_string);

            match (status, code.as_str()) {
                (412, _) | (_, "PreconditionFailed") => {
                    TransportError::PreconditionFailed(format!("{}: {}", target, message))
                }
                (_, "NoSuchUpload") => TransportError::NoSuchUpload(target.to_string()),
                (404, _) | (_, "NoSuchKey") => TransportError::NotFound(target.to_string()),
                _ => TransportError::Status {
                    status,
                    code,
                    message,
                    request_id,
                },
            }
        }
        _ => TransportError::Network(format!("{}: {:?}", target, error)),
    }
}

fn missing(field: &str, target: &str) -> TransportError {
    TransportError::Status {
        status: 200,
        code: "MalformedResponse".to_string(),
        message: format!("{} missing from response for {}", field, target),
        request_id: None,
    }
}

fn into_body(body: ByteStream) -> BodyStream {
    Box::pin(stream::try_unfold(body, |mut body| async move {
        match body.try_next().await {
            Ok(Some(chunk)) => Ok(Some((chunk, body))),
            Ok(None) => Ok(None),
            Err(e) => Err(TransportError::Network(format!("body stream: {}", e))),
        }
    }))
}

#[async_trait]
impl Transport for S3Transport {
    async fn head(&self, location: &ObjectLocation) -> TransportResult<ObjectMeta> {
        let target = location.to_string();
        let response = self
            .client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| map_sdk_error(&target, e))?;

        let size = response
            .content_length()
            .and_then(|len| u64::try_from(len).ok())
            .ok_or_else(|| missing("Content-Length", &target))?;
        let etag = response
            .e_tag()
            .ok_or_else(|| missing("ETag", &target))?
            .to_string();
        let mtime = response.last_modified().map(|t| t.secs()).unwrap_or(0);

        Ok(ObjectMeta {
            size,
            mtime,
            etag,
            crc64: None,
        })
    }

    async fn get(
        &self,
        location: &ObjectLocation,
        range: Option<Range<u64>>,
        if_match: Option<&str>,
    ) -> TransportResult<BodyStream> {
        let target = location.to_string();
        let mut request = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .set_if_match(if_match.map(str::to_string));

        if let Some(range) = range {
            if range.is_empty() {
                return Ok(Box::pin(stream::empty()));
            }
            request = request.range(format!("bytes={}-{}", range.start, range.end - 1));
        }

        let response = request.send().await.map_err(|e| map_sdk_error(&target, e))?;
        Ok(into_body(response.body))
    }

    async fn put_object(
        &self,
        location: &ObjectLocation,
        body: Bytes,
    ) -> TransportResult<CommitResult> {
        let target = location.to_string();
        let response = self
            .client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(&target, e))?;

        Ok(CommitResult {
            etag: response.e_tag().unwrap_or_default().to_string(),
            crc64: None,
        })
    }

    async fn initiate_multipart(&self, location: &ObjectLocation) -> TransportResult<String> {
        let target = location.to_string();
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| map_sdk_error(&target, e))?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| missing("UploadId", &target))?
            .to_string();
        debug!(target = %target, upload_id = %upload_id, "Multipart upload created");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> TransportResult<UploadedPart> {
        let target = format!("{} part {}", location, part_number);
        let number = i32::try_from(part_number).map_err(|_| TransportError::Status {
            status: 400,
            code: "InvalidArgument".to_string(),
            message: format!("part number {} out of range", part_number),
            request_id: None,
        })?;

        let response = self
            .client
            .upload_part()
            .bucket(&location.bucket)
            .key(&location.key)
            .upload_id(upload_id)
            .part_number(number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(&target, e))?;

        let etag = response
            .e_tag()
            .ok_or_else(|| missing("ETag", &target))?
            .to_string();
        Ok(UploadedPart { etag, crc64: None })
    }

    async fn list_parts(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
    ) -> TransportResult<Vec<ListedPart>> {
        let target = location.to_string();
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let response = self
                .client
                .list_parts()
                .bucket(&location.bucket)
                .key(&location.key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(upload_id, e))?;

            parts.extend(response.parts().iter().filter_map(|p| {
                Some(ListedPart {
                    part_number: u32::try_from(p.part_number()?).ok()?,
                    etag: p.e_tag()?.to_string(),
                    size: u64::try_from(p.size()?).ok()?,
                })
            }));

            match (response.is_truncated(), response.next_part_number_marker()) {
                (Some(true), Some(next)) => marker = Some(next.to_string()),
                _ => break,
            }
        }

        debug!(target = %target, upload_id, parts = parts.len(), "Listed uploaded parts");
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        parts: &[PartTag],
    ) -> TransportResult<CommitResult> {
        let target = location.to_string();
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error(&target, e))?;

        Ok(CommitResult {
            etag: response.e_tag().unwrap_or_default().to_string(),
            crc64: None,
        })
    }

    async fn abort_multipart(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
    ) -> TransportResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(upload_id, e))?;
        Ok(())
    }
}
