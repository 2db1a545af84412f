use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// Read-only access to remote listings and files.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_text(&self, url: &Url) -> Result<String>;
    async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client })
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response> {
        log::debug!("Fetching: {}", url);

        let res = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::fetch(url, describe(&e)))?;

        let status = res.status();
        if !status.is_success() {
            return Err(Error::fetch(url, format!("HTTP status {}", status)));
        }
        Ok(res)
    }
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_text(&self, url: &Url) -> Result<String> {
        let res = self.get(url).await?;
        let text = res.text().await.map_err(|e| Error::fetch(url, describe(&e)))?;
        log::debug!("Listing length: {} bytes", text.len());
        Ok(text)
    }

    async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        let res = self.get(url).await?;
        let bytes = res.bytes().await.map_err(|e| Error::fetch(url, describe(&e)))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.zip"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), "gridcrawl-test").unwrap();
        let url = Url::parse(&format!("{}/missing.zip", server.uri())).unwrap();
        let err = fetcher.fetch_bytes(&url).await.unwrap_err();

        match err {
            Error::Fetch { reason, .. } => assert!(reason.contains("404")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_millis(50), "gridcrawl-test").unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher.fetch_text(&url).await.unwrap_err();

        assert!(matches!(err, Error::Fetch { .. }));
    }

    #[tokio::test]
    async fn returns_body_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"C,HEADER".to_vec()))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), "gridcrawl-test").unwrap();
        let url = Url::parse(&format!("{}/file.csv", server.uri())).unwrap();
        assert_eq!(fetcher.fetch_bytes(&url).await.unwrap(), b"C,HEADER".to_vec());
    }
}
