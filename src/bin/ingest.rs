use anyhow::{anyhow, Result};
use aws_lambda_events::event::apigw::ApiGatewayProxyRequest;
use image_pipeline::app;
use image_pipeline::http::HttpResponse;
use lambda_runtime::{run, service_fn, LambdaEvent};

/// Store the base64-encoded image carried by the request.
async fn function_handler(event: LambdaEvent<ApiGatewayProxyRequest>) -> Result<HttpResponse> {
    Ok(app::current()
        .ingest(event.payload.into(), &event.context.request_id)
        .await)
}

/// Run an AWS Lambda function that accepts base64-encoded images over
/// an API Gateway proxy integration and writes them, unmodified, to
/// the raw container.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    app::init().await?;

    run(service_fn(function_handler))
        .await
        .map_err(|e| anyhow!("{:?}", e))
}
