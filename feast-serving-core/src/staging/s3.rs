use crate::staging::StagingClient;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::Duration;

fn parse_s3_url(s3_url: &str) -> Result<(String, String)> {
    let url = url::Url::parse(s3_url)?;
    if url.scheme() != "s3" {
        return Err(anyhow!("Invalid S3 URL scheme in '{}'", s3_url));
    }
    let bucket = url
        .host_str()
        .ok_or_else(|| anyhow!("Invalid S3 URL '{}'", s3_url))?
        .to_string();
    let key = url.path().trim_start_matches('/').to_string();
    Ok((bucket, key))
}

/// Staging in an S3 bucket, addressed with `s3://bucket/key` URIs.
pub struct S3StagingClient {
    client: aws_sdk_s3::Client,
    root: String,
    ttl: Duration,
}

impl S3StagingClient {
    pub async fn from_env(root: &str, ttl: Duration) -> Result<Self> {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), root, ttl)
    }

    pub fn new(client: aws_sdk_s3::Client, root: &str, ttl: Duration) -> Result<Self> {
        parse_s3_url(root)?;
        Ok(Self {
            client,
            root: root.trim_end_matches('/').to_string(),
            ttl,
        })
    }

    fn object_for(&self, uri: &str) -> Result<(String, String)> {
        if !uri.starts_with(&format!("{}/", self.root)) {
            return Err(anyhow!(
                "Staging URI '{}' is outside the staging root {}",
                uri,
                self.root
            ));
        }
        let (bucket, key) = parse_s3_url(uri)?;
        if key.is_empty() || key.split('/').any(|segment| segment == "..") {
            return Err(anyhow!("Invalid staging object key in '{}'", uri));
        }
        Ok((bucket, key))
    }
}

#[async_trait]
impl StagingClient for S3StagingClient {
    fn root(&self) -> &str {
        &self.root
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn put(&self, uri: &str, data: Vec<u8>) -> Result<()> {
        let (bucket, key) = self.object_for(uri)?;
        self.client
            .put_object()
            .bucket(&bucket)
            .key(&key)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", uri))?;
        Ok(())
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let (bucket, key) = self.object_for(uri)?;
        let object = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", uri))?;
        let data = object.body.collect().await?.into_bytes();
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bucket_and_key() -> Result<()> {
        assert_eq!(
            parse_s3_url("s3://feast-staging/serving/out")?,
            ("feast-staging".to_string(), "serving/out".to_string())
        );
        assert!(parse_s3_url("gs://bucket/key").is_err());
        Ok(())
    }

    #[tokio::test]
    #[ignore]
    async fn round_trip_through_bucket() -> Result<()> {
        let client = S3StagingClient::from_env("s3://feast-staging/serving", Duration::hours(1)).await?;
        let location = client.location(Some("it"))?;
        client.put(&location.uri, b"{}\n".to_vec()).await?;
        assert_eq!(client.get(&location.uri).await?, b"{}\n".to_vec());
        Ok(())
    }
}
