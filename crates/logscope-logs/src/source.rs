use std::io;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{AsyncBufRead, AsyncBufReadExt, FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use tracing::debug;

use logscope_k8s::KubeClient;
use logscope_types::{Credential, StreamError, SubscriptionKey};

use crate::parser::FrameFormat;

/// Raw frames from one live transport connection
pub type LineStream = BoxStream<'static, io::Result<String>>;

/// Split a byte stream into newline-delimited frames.
///
/// Undecodable bytes are replaced rather than failing the read, so one bad
/// line cannot end the connection. Only transport errors surface as `Err`,
/// and nothing is read after one.
pub fn frame_lines<R>(reader: R) -> LineStream
where
    R: AsyncBufRead + Send + 'static,
{
    futures::stream::unfold(Some(Box::pin(reader)), |reader| async move {
        let mut reader = reader?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(decode_frame(buf)), Some(reader))),
            Err(err) => Some((Err(err), None)),
        }
    })
    .boxed()
}

fn decode_frame(mut bytes: Vec<u8>) -> String {
    while matches!(bytes.last(), Some(b'\n' | b'\r')) {
        bytes.pop();
    }
    match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(err) => {
            debug!("replacing invalid UTF-8 in log frame");
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }
    }
}

/// Options for opening a stream or fetching history
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    /// Historical lines to replay before following
    pub tail_lines: Option<i64>,

    /// Only lines newer than this many seconds
    pub since_seconds: Option<i64>,

    /// Reconnect point; the adapter drops records at or before it
    pub resume_after: Option<DateTime<Utc>>,

    pub format: FrameFormat,
}

impl StreamOptions {
    /// Since-seconds window that covers `resume_after`, rounded up
    pub fn resume_window(&self, now: DateTime<Utc>) -> Option<i64> {
        self.resume_after
            .map(|after| (now - after).num_seconds().max(0) + 1)
    }
}

/// A cluster-side log endpoint.
///
/// `open_stream` establishes one continuous connection; dropping the returned
/// future or stream releases it. `fetch_history` is the one-shot path.
pub trait LogSource: Send + Sync {
    fn open_stream(
        &self,
        key: &SubscriptionKey,
        credential: &Credential,
        options: &StreamOptions,
    ) -> BoxFuture<'static, Result<LineStream, StreamError>>;

    fn fetch_history(
        &self,
        key: &SubscriptionKey,
        credential: &Credential,
        options: &StreamOptions,
    ) -> BoxFuture<'static, Result<String, StreamError>>;
}

/// Log source backed by the Kubernetes pod log API
#[derive(Clone)]
pub struct KubeLogSource {
    client: KubeClient,
}

impl KubeLogSource {
    pub fn new(client: KubeClient) -> Self {
        Self { client }
    }

    fn log_params(key: &SubscriptionKey, options: &StreamOptions, follow: bool) -> LogParams {
        // A resume window replaces both the tail and the configured range
        let since_seconds = options
            .resume_window(Utc::now())
            .or(options.since_seconds);
        LogParams {
            follow,
            container: Some(key.container.clone()),
            tail_lines: if since_seconds.is_some() {
                None
            } else {
                options.tail_lines
            },
            since_seconds,
            timestamps: true,
            ..Default::default()
        }
    }

    async fn pods_api(
        client: &KubeClient,
        key: &SubscriptionKey,
        credential: &Credential,
    ) -> Result<Api<Pod>, StreamError> {
        let kube_client = client
            .client_for_context(&key.cluster, credential)
            .await
            .map_err(|e| StreamError::ConnectionLost(format!("{:#}", e)))?;
        Ok(Api::namespaced(kube_client, &key.namespace))
    }
}

impl LogSource for KubeLogSource {
    fn open_stream(
        &self,
        key: &SubscriptionKey,
        credential: &Credential,
        options: &StreamOptions,
    ) -> BoxFuture<'static, Result<LineStream, StreamError>> {
        let client = self.client.clone();
        let key = key.clone();
        let credential = credential.clone();
        let params = Self::log_params(&key, options, true);

        async move {
            let pods = Self::pods_api(&client, &key, &credential).await?;
            let reader = pods
                .log_stream(&key.pod, &params)
                .await
                .map_err(|e| map_kube_error(e, StreamError::ConnectionLost))?;
            Ok(frame_lines(reader))
        }
        .boxed()
    }

    fn fetch_history(
        &self,
        key: &SubscriptionKey,
        credential: &Credential,
        options: &StreamOptions,
    ) -> BoxFuture<'static, Result<String, StreamError>> {
        let client = self.client.clone();
        let key = key.clone();
        let credential = credential.clone();
        let params = Self::log_params(&key, options, false);

        async move {
            let pods = Self::pods_api(&client, &key, &credential)
                .await
                .map_err(|e| StreamError::HistoryFetch(e.to_string()))?;
            pods.logs(&key.pod, &params)
                .await
                .map_err(|e| map_kube_error(e, StreamError::HistoryFetch))
        }
        .boxed()
    }
}

/// Rejected credentials become `Unauthorized`; everything else uses `fallback`
fn map_kube_error(err: kube::Error, fallback: fn(String) -> StreamError) -> StreamError {
    match &err {
        kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => {
            StreamError::Unauthorized(resp.message.clone())
        }
        _ => fallback(err.to_string()),
    }
}
