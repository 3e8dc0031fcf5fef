use anyhow::{anyhow, Result};
use aws_lambda_events::event::apigw::ApiGatewayProxyRequest;
use image_pipeline::app;
use image_pipeline::http::HttpResponse;
use lambda_runtime::{run, service_fn, LambdaEvent};

/// Resize the stored image named by the request and publish it.
async fn function_handler(event: LambdaEvent<ApiGatewayProxyRequest>) -> Result<HttpResponse> {
    Ok(app::current()
        .transform(event.payload.into(), &event.context.request_id)
        .await)
}

/// Run an AWS Lambda function that downloads a stored image, resizes
/// it to a 300x300 JPEG, and publishes it to the processed container
/// together with a JSON status record.
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
