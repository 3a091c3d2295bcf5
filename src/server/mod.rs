//! HTTP transport
//!
//! One tokio task per connection, HTTP/1.1 only. Blocking coordinator work
//! runs on the blocking pool. Upload bodies are streamed to the postcache
//! file as they arrive and archives are streamed back from disk; everything
//! else is small and buffered.

mod routes;

pub use routes::Route;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dcc_protocol::{FormFields, LinkTicketForm, ReadyForm, RemoveWipForm, WipForm};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::exchange::{Download, ExchangeContext, ExchangeError, ExchangeResult};

/// Response body: buffered text or a file streamed from disk
pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// Read size for streamed downloads
const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Bind the configured address and serve until interrupted.
pub async fn serve(ctx: Arc<ExchangeContext>) -> io::Result<()> {
    let listener = TcpListener::bind(&ctx.config().listen).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "listening");
    serve_listener(listener, ctx).await
}

/// Serve connections from an already bound listener until ctrl-c.
pub async fn serve_listener(listener: TcpListener, ctx: Arc<ExchangeContext>) -> io::Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                info!("shutdown requested");
                return Ok(());
            }
        };
        let io = TokioIo::new(stream);
        let ctx = Arc::clone(&ctx);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, Arc::clone(&ctx), peer));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer, error = %e, "connection error");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ExchangeContext>,
    peer: SocketAddr,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let method = req.method().clone();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    debug!(%peer, %method, %target, "request");

    let route = match Route::parse(&method, &target) {
        Ok(Some(route)) => route,
        Ok(None) => return Ok(text_response(StatusCode::NOT_FOUND, "not found\n")),
        Err(e) => return Ok(error_response(&ExchangeError::from(e))),
    };

    let response = match route {
        Route::Upload { folder } => handle_upload(req.into_body(), &ctx, folder).await,
        route if route.takes_form() => {
            let query = req.uri().query().map(str::to_string);
            let body = req.into_body().collect().await?.to_bytes();
            let form = FormFields::parse(&body, query.as_deref());
            handle_form(&ctx, route, form).await
        }
        route => handle_get(&ctx, route).await,
    };
    Ok(response)
}

/// Handle a GET route.
pub async fn handle_get(ctx: &Arc<ExchangeContext>, route: Route) -> Response<ResponseBody> {
    let result = match route {
        Route::CachingEnabled => Ok(text_response(StatusCode::OK, ctx.caching_enabled())),
        Route::CreateArchive { folder } => {
            match blocking(ctx, move |ctx| ctx.precache_download(&folder)).await {
                Ok(download) => attachment_response(download).await,
                Err(e) => Err(e),
            }
        }
        Route::TransformSupport => match blocking(ctx, |ctx| ctx.support_download()).await {
            Ok(download) => attachment_response(download).await,
            Err(e) => Err(e),
        },
        Route::TemplateById { template_id } => {
            blocking(ctx, move |ctx| ctx.template_path(&template_id))
                .await
                .map(|path| text_response(StatusCode::OK, &path))
        }
        Route::ChangeStatus { ticket } => blocking(ctx, move |ctx| ctx.change_status(&ticket))
            .await
            .map(|status| json_response(StatusCode::OK, status.to_json())),
        other => return method_mismatch(&other),
    };
    result.unwrap_or_else(|e| error_response(&e))
}

/// Handle a form POST route.
pub async fn handle_form(
    ctx: &Arc<ExchangeContext>,
    route: Route,
    form: FormFields,
) -> Response<ResponseBody> {
    let result = match route {
        Route::LinkTicket => match LinkTicketForm::from_fields(&form) {
            Ok(form) => blocking(ctx, move |ctx| ctx.link_ticket(&form))
                .await
                .map(|folder| text_response(StatusCode::OK, &folder)),
            Err(e) => Err(e.into()),
        },
        Route::Ready => match ReadyForm::from_fields(&form) {
            Ok(form) => blocking(ctx, move |ctx| ctx.set_ready(&form))
                .await
                .map(|_| text_response(StatusCode::OK, "")),
            Err(e) => Err(e.into()),
        },
        Route::Wip => match WipForm::from_fields(&form) {
            Ok(form) => blocking(ctx, move |ctx| ctx.record_wip(&form))
                .await
                .map(|_| text_response(StatusCode::OK, "")),
            Err(e) => Err(e.into()),
        },
        Route::RemoveWip => match RemoveWipForm::from_fields(&form) {
            Ok(form) => blocking(ctx, move |ctx| ctx.remove_wip(&form))
                .await
                .map(|_| text_response(StatusCode::OK, "")),
            Err(e) => Err(e.into()),
        },
        other => return method_mismatch(&other),
    };
    result.unwrap_or_else(|e| error_response(&e))
}

/// Accept a postcache upload.
///
/// The body is persisted before anything is expanded. Any failure while
/// receiving aborts the upload bracket.
pub async fn handle_upload<B>(
    body: B,
    ctx: &Arc<ExchangeContext>,
    folder: String,
) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let session = match blocking(ctx, move |ctx| ctx.begin_upload(&folder)).await {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };

    let bytes = match session.receive(body, ctx.upload_limit()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let reason = e.to_string();
            let _ = tokio::task::spawn_blocking(move || session.abort(&reason)).await;
            return error_response(&e);
        }
    };

    match join(tokio::task::spawn_blocking(move || session.complete(bytes)).await) {
        Ok(outcome) => text_response(StatusCode::OK, &outcome.message()),
        Err(e) => error_response(&e),
    }
}

/// Run coordinator work on the blocking pool.
async fn blocking<T, F>(ctx: &Arc<ExchangeContext>, f: F) -> ExchangeResult<T>
where
    F: FnOnce(&ExchangeContext) -> ExchangeResult<T> + Send + 'static,
    T: Send + 'static,
{
    let ctx = Arc::clone(ctx);
    join(tokio::task::spawn_blocking(move || f(&ctx)).await)
}

fn join<T>(joined: Result<ExchangeResult<T>, tokio::task::JoinError>) -> ExchangeResult<T> {
    match joined {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "blocking task failed");
            Err(ExchangeError::Io(io::Error::other(e)))
        }
    }
}

fn method_mismatch(route: &Route) -> Response<ResponseBody> {
    warn!(?route, "route reached the wrong handler");
    text_response(StatusCode::NOT_FOUND, "not found\n")
}

fn error_response(err: &ExchangeError) -> Response<ResponseBody> {
    let code = err.code();
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(code = %code, error = %err, "request failed");
    } else {
        warn!(code = %code, error = %err, "request rejected");
    }
    text_response(status, &format!("{}\n", err.client_reason()))
}

fn full(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn text_response(status: StatusCode, body: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(full(Bytes::from_static(b"internal error"))))
}

fn json_response(status: StatusCode, body: String) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(full(Bytes::from_static(b"{\"error\":\"internal\"}"))))
}

/// Chunks of an open file, ending at EOF.
fn file_body(file: tokio::fs::File) -> ResponseBody {
    let chunks = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = BytesMut::with_capacity(DOWNLOAD_CHUNK);
        let read = file.read_buf(&mut buf).await?;
        let next = (read > 0).then(|| (Frame::data(buf.freeze()), file));
        Ok::<_, io::Error>(next)
    });
    StreamBody::new(chunks).boxed_unsync()
}

async fn attachment_response(download: Download) -> ExchangeResult<Response<ResponseBody>> {
    let file = tokio::fs::File::open(&download.path).await?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.file_name.replace(['"', '\\'], "_")
    );
    debug!(file = %download.file_name, len = download.len, "streaming attachment");
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, download.content_type)
        .header(CONTENT_LENGTH, download.len)
        .header(CONTENT_DISPOSITION, disposition)
        .body(file_body(file))
        .map_err(|e| ExchangeError::Io(io::Error::other(e)))
}
