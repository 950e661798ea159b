use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use crate::{
    config::non_empty,
    error::{ApiError, ProcessorError},
    processor::{DownloadedFile, FormatDescriptor, VideoProcessor},
    storage,
};

const INDEX_HTML: &str = include_str!("../templates/index.html");

const URL_REQUIRED: &str = "URL is required";
const INVALID_URL: &str = "Please enter a valid URL";
const INFO_UNSUPPORTED: &str =
    "This platform is not supported. Supported platforms: YouTube, Instagram, TikTok, Twitter/X";
const DOWNLOAD_UNSUPPORTED: &str = "This platform is not supported";
const INVALID_BODY: &str = "Invalid request body";
const INFO_UNEXPECTED: &str = "An unexpected error occurred. Please try again.";
const DOWNLOAD_UNEXPECTED: &str = "An unexpected error occurred during download";
const SEND_FAILED: &str = "Error sending file for download";

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<VideoProcessor>,
    pub download_semaphore: Arc<Semaphore>,
    pub download_retention: Duration,
    /// Age after which leftovers in the storage root are swept before a
    /// download starts. Zero disables the sweep.
    pub stale_after: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct VideoInfoRequest {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    format_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct VideoInfoResponse {
    success: bool,
    title: String,
    duration: String,
    thumbnail: String,
    uploader: String,
    formats: Vec<FormatDescriptor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/get_video_info", post(get_video_info))
        .route("/download_video", post(download_video))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn not_found() -> (StatusCode, Html<&'static str>) {
    (StatusCode::NOT_FOUND, Html(INDEX_HTML))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy", "service": "video-downloader"}))
}

/// Runs the three URL checks shared by both endpoints and returns the
/// trimmed URL.
fn validate_url<'a>(
    processor: &VideoProcessor,
    url: Option<&'a str>,
    unsupported_message: &str,
) -> Result<&'a str, ProcessorError> {
    let url = url.map(str::trim).unwrap_or_default();
    if url.is_empty() {
        return Err(ProcessorError::Input(URL_REQUIRED.to_string()));
    }
    if !processor.is_valid_url(url) {
        return Err(ProcessorError::Input(INVALID_URL.to_string()));
    }
    if !processor.is_supported_platform(url) {
        return Err(ProcessorError::Input(unsupported_message.to_string()));
    }
    Ok(url)
}

fn reject_body(rejection: JsonRejection) -> ApiError {
    info!(%rejection, "rejected request body");
    ApiError::from_processor(ProcessorError::Input(INVALID_BODY.to_string()), INVALID_BODY)
}

async fn get_video_info(
    State(state): State<AppState>,
    payload: Result<Json<VideoInfoRequest>, JsonRejection>,
) -> Result<Json<VideoInfoResponse>, ApiError> {
    let Json(payload) = payload.map_err(reject_body)?;
    let url = validate_url(&state.processor, payload.url.as_deref(), INFO_UNSUPPORTED)
        .map_err(|error| ApiError::from_processor(error, INFO_UNEXPECTED))?;

    let info = state
        .processor
        .fetch_info(url)
        .await
        .map_err(|error| ApiError::from_processor(error, INFO_UNEXPECTED))?;

    Ok(Json(VideoInfoResponse {
        success: true,
        title: info.title,
        duration: info.duration,
        thumbnail: info.thumbnail,
        uploader: info.uploader,
        formats: info.formats,
    }))
}

async fn download_video(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload.map_err(reject_body)?;
    let url = validate_url(&state.processor, payload.url.as_deref(), DOWNLOAD_UNSUPPORTED)
        .map_err(|error| ApiError::from_processor(error, DOWNLOAD_UNEXPECTED))?;
    let format_id = payload
        .format_id
        .as_deref()
        .and_then(non_empty)
        .unwrap_or("best");

    let _permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal(DOWNLOAD_UNEXPECTED))?;

    storage::cleanup_stale_downloads(state.processor.storage_root(), state.stale_after).await;

    let downloaded = state
        .processor
        .download(url, format_id)
        .await
        .map_err(|error| ApiError::from_processor(error, DOWNLOAD_UNEXPECTED))?;

    file_response(downloaded, state.download_retention).await
}

/// Streams a finished download as an attachment. On failure the file is
/// deleted and the client gets a send error.
async fn file_response(
    downloaded: DownloadedFile,
    retention: Duration,
) -> Result<Response, ApiError> {
    match prepare_file_response(&downloaded).await {
        Ok(response) => {
            storage::schedule_removal(downloaded.path, retention);
            Ok(response)
        }
        Err(detail) => {
            error!(path = %downloaded.path.display(), %detail, "error sending file");
            if let Err(error) = tokio::fs::remove_file(&downloaded.path).await
                && error.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %downloaded.path.display(), %error, "could not remove unsent file");
            }
            Err(ApiError::internal(SEND_FAILED))
        }
    }
}

async fn prepare_file_response(downloaded: &DownloadedFile) -> Result<Response, String> {
    let metadata = tokio::fs::metadata(&downloaded.path)
        .await
        .map_err(|error| error.to_string())?;
    let file = tokio::fs::File::open(&downloaded.path)
        .await
        .map_err(|error| error.to_string())?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&downloaded.filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&attachment_disposition(&downloaded.filename))
            .map_err(|error| error.to_string())?,
    );

    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp3" => "audio/mp3",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// `filename` carries a plain-ASCII fallback for older clients and
/// `filename*` the exact UTF-8 name.
fn attachment_disposition(filename: &str) -> String {
    let (stem, ext) = filename.rsplit_once('.').unwrap_or((filename, ""));
    let mut fallback: String = stem
        .chars()
        .map(|character| match character {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | ' ' => character,
            _ => '_',
        })
        .collect();
    if fallback.trim_matches(|c| c == '_' || c == ' ').is_empty() {
        fallback = "video".to_string();
    }
    if !ext.is_empty() {
        fallback.push('.');
        fallback.push_str(ext);
    }

    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::engine::{DownloadJob, EngineError, EngineFormat, EngineInfo, MediaEngine};

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        FailInfo(&'static str),
        FailDownload(&'static str),
        LoseArtifact,
    }

    struct StubEngine {
        behavior: Behavior,
    }

    #[async_trait]
    impl MediaEngine for StubEngine {
        async fn extract_info(&self, _url: &str) -> Result<EngineInfo, EngineError> {
            if let Behavior::FailInfo(message) = self.behavior {
                return Err(EngineError::Failed(message.to_string()));
            }
            Ok(EngineInfo {
                title: Some("Test Clip: Part 1".to_string()),
                duration: Some(3725.0),
                thumbnail: Some("https://i.ytimg.com/x.jpg".to_string()),
                uploader: Some("Channel".to_string()),
                formats: Some(vec![EngineFormat {
                    format_id: "137".to_string(),
                    ext: Some("mp4".to_string()),
                    vcodec: Some("avc1".to_string()),
                    acodec: Some("none".to_string()),
                    height: Some(1080),
                    ..EngineFormat::default()
                }]),
            })
        }

        async fn download(&self, job: &DownloadJob) -> Result<Option<PathBuf>, EngineError> {
            let ext = if job.merge_to_mp4 { "mp4" } else { "m4a" };
            let path = PathBuf::from(
                job.output_template
                    .replace("%(title)s.%(ext)s", &format!("Test Clip Part 1.{ext}")),
            );
            match self.behavior {
                Behavior::FailDownload(message) => {
                    std::fs::write(path.with_extension("mp4.part"), b"half").unwrap();
                    Err(EngineError::Failed(message.to_string()))
                }
                Behavior::LoseArtifact => Ok(Some(path)),
                Behavior::Succeed | Behavior::FailInfo(_) => {
                    std::fs::write(&path, b"media-bytes").unwrap();
                    Ok(Some(path))
                }
            }
        }
    }

    fn app_with(behavior: Behavior) -> (Router, TempDir) {
        let root = TempDir::new().unwrap();
        let processor = VideoProcessor::new(Arc::new(StubEngine { behavior }), root.path());
        let state = AppState {
            processor: Arc::new(processor),
            download_semaphore: Arc::new(Semaphore::new(1)),
            download_retention: Duration::ZERO,
            stale_after: Duration::ZERO,
        };
        (router(state), root)
    }

    fn app(fail_with: Option<&'static str>) -> (Router, TempDir) {
        app_with(fail_with.map_or(Behavior::Succeed, Behavior::FailInfo))
    }

    fn leftovers(root: &TempDir) -> usize {
        std::fs::read_dir(root.path()).unwrap().count()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn error_for(uri: &str, body: serde_json::Value) -> (StatusCode, String) {
        let (app, _root) = app(None);
        let response = app.oneshot(post_json(uri, body)).await.unwrap();
        let status = response.status();
        let body = json_body(response).await;
        (status, body["error"].as_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn metadata_rejects_bad_urls() {
        let cases = [
            (serde_json::json!({"url": ""}), URL_REQUIRED),
            (serde_json::json!({}), URL_REQUIRED),
            (serde_json::json!({"url": "ftp:nohost"}), INVALID_URL),
            (serde_json::json!({"url": "https://example.com/x"}), INFO_UNSUPPORTED),
        ];
        for (body, expected) in cases {
            let (status, error) = error_for("/get_video_info", body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(error, expected);
        }
    }

    #[tokio::test]
    async fn download_uses_its_own_unsupported_message() {
        let (status, error) =
            error_for("/download_video", serde_json::json!({"url": "https://example.com/x"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error, DOWNLOAD_UNSUPPORTED);
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let (app, _root) = app(None);
        let request = Request::builder()
            .method("POST")
            .uri("/get_video_info")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], INVALID_BODY);
    }

    #[tokio::test]
    async fn metadata_success_shape() {
        let (app, _root) = app(None);
        let response = app
            .oneshot(post_json(
                "/get_video_info",
                serde_json::json!({"url": "  https://www.youtube.com/watch?v=abc  "}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["title"], "Test Clip: Part 1");
        assert_eq!(body["duration"], "1:02:05");
        assert_eq!(body["uploader"], "Channel");
        let formats = body["formats"].as_array().unwrap();
        assert_eq!(formats.len(), 5);
        assert_eq!(formats[0]["format_id"], "bestvideo+bestaudio/best");
        assert_eq!(formats[4]["description"], "1080p (Video only)");
    }

    #[tokio::test]
    async fn engine_failure_is_forwarded() {
        let (app, _root) = app(Some("Private video. Sign in if you've been granted access"));
        let response = app
            .oneshot(post_json(
                "/get_video_info",
                serde_json::json!({"url": "https://youtu.be/abc"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = json_body(response).await["error"].as_str().unwrap().to_string();
        assert!(error.contains("Private video"));
        assert!(error.starts_with("Could not extract video information"));
    }

    #[tokio::test]
    async fn download_streams_an_attachment() {
        let (app, _root) = app(None);
        let response = app
            .oneshot(post_json(
                "/download_video",
                serde_json::json!({"url": "https://youtu.be/abc"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
        assert_eq!(response.headers()[CONTENT_LENGTH], "11");
        let disposition = response.headers()[CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment;"));
        assert!(disposition.contains("filename=\"Test-Clip-Part-1.mp4\""));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"media-bytes");
    }

    #[tokio::test]
    async fn audio_download_gets_audio_mime() {
        let (app, _root) = app(None);
        let response = app
            .oneshot(post_json(
                "/download_video",
                serde_json::json!({
                    "url": "https://youtu.be/abc",
                    "format_id": "bestaudio[ext=m4a]/bestaudio"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "audio/mp4");
    }

    #[tokio::test]
    async fn health_and_fallback() {
        let (app, _root) = app(None);
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"status": "healthy", "service": "video-downloader"})
        );

        let response = app
            .oneshot(Request::get("/no/such/page").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let content_type = response.headers()[CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/html"));
    }

    #[tokio::test]
    async fn wrong_method_on_a_known_route_is_405() {
        let (app, _root) = app(None);
        let response = app
            .oneshot(Request::get("/get_video_info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn mime_types_by_extension() {
        assert_eq!(content_type_for_filename("a.mp3"), "audio/mp3");
        assert_eq!(content_type_for_filename("a.M4A"), "audio/mp4");
        assert_eq!(content_type_for_filename("a.mp4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.webm"), "application/octet-stream");
        assert_eq!(content_type_for_filename("noext"), "application/octet-stream");
    }

    #[test]
    fn content_disposition_keeps_unicode_in_extended_form() {
        assert_eq!(
            attachment_disposition("Café clip.mp4"),
            "attachment; filename=\"Caf_ clip.mp4\"; filename*=UTF-8''Caf%C3%A9%20clip.mp4"
        );
        assert_eq!(
            attachment_disposition("日本.m4a"),
            "attachment; filename=\"video.m4a\"; filename*=UTF-8''%E6%97%A5%E6%9C%AC.m4a"
        );
    }

    fn download_request() -> Request<Body> {
        post_json("/download_video", serde_json::json!({"url": "https://youtu.be/abc"}))
    }

    #[tokio::test]
    async fn download_engine_failure_is_a_bad_request() {
        let (app, root) = app_with(Behavior::FailDownload("HTTP Error 403: Forbidden"));
        let response = app.oneshot(download_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"],
            "Download failed: HTTP Error 403: Forbidden"
        );
        assert_eq!(leftovers(&root), 0);
    }

    #[tokio::test]
    async fn missing_artifact_hides_internal_detail() {
        let (app, root) = app_with(Behavior::LoseArtifact);
        let response = app.oneshot(download_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"error": DOWNLOAD_UNEXPECTED})
        );
        assert_eq!(leftovers(&root), 0);
    }

    #[tokio::test]
    async fn unreadable_file_is_a_send_error() {
        let root = TempDir::new().unwrap();
        let downloaded = DownloadedFile {
            path: root.path().join("20260101_000000_aaaaaaaa_gone.mp4"),
            filename: "gone.mp4".to_string(),
        };

        let Err(error) = file_response(downloaded, Duration::ZERO).await else {
            panic!("a missing file must not produce a response");
        };
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.message, SEND_FAILED);

        let response = error.into_response();
        assert_eq!(json_body(response).await["error"], SEND_FAILED);
    }

    #[tokio::test]
    async fn stale_leftovers_are_swept_before_a_download() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("19990101_000000_old.mp4.part"), b"x").unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        let processor =
            VideoProcessor::new(Arc::new(StubEngine { behavior: Behavior::Succeed }), root.path());
        let app = router(AppState {
            processor: Arc::new(processor),
            download_semaphore: Arc::new(Semaphore::new(1)),
            download_retention: Duration::ZERO,
            stale_after: Duration::from_secs(1),
        });

        let response = app.oneshot(download_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!root.path().join("19990101_000000_old.mp4.part").exists());
        assert_eq!(leftovers(&root), 1);
    }
}
