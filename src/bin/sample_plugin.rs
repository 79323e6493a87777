//! Minimal plugin used for manual testing and the process launch tests.
//!
//! Registers as `my-plugin` with a single `scan` command that reports one
//! right-sizing item from a background job.

use async_trait::async_trait;
use kaytu::protocol::{
    CommandDescriptor, Device, FlagDescriptor, OptimizationItem, ReEvaluate, RegisterConfig,
    StartProcess,
};
use kaytu::sdk::{job_fn, serve, JobProperties, ProcessContext, Processor, SdkResult};

struct SamplePlugin;

fn item(region: &str, right_sized_cost: f64) -> OptimizationItem {
    OptimizationItem {
        id: "r1".into(),
        name: "sample-instance".into(),
        resource_type: "m5.large".into(),
        region: region.into(),
        devices: vec![Device {
            device_id: "r1".into(),
            resource_type: "m5.large".into(),
            current_cost: 10.0,
            right_sized_cost,
            ..Device::default()
        }],
        ..OptimizationItem::default()
    }
}

#[async_trait]
impl Processor for SamplePlugin {
    fn config(&self) -> RegisterConfig {
        RegisterConfig {
            name: "my-plugin".into(),
            version: "1.0".into(),
            provider: "sample".into(),
            commands: vec![CommandDescriptor {
                name: "scan".into(),
                description: "Report a sample right-sizing".into(),
                flags: vec![FlagDescriptor {
                    name: "region".into(),
                    default: "us-east-1".into(),
                    description: "Region to scan".into(),
                    ..FlagDescriptor::default()
                }],
                ..CommandDescriptor::default()
            }],
            ..RegisterConfig::default()
        }
    }

    async fn start_process(&self, request: StartProcess, ctx: ProcessContext) -> SdkResult<()> {
        let region = request
            .flags
            .get("region")
            .cloned()
            .unwrap_or_else(|| "us-east-1".into());
        let job_ctx = ctx.clone();
        ctx.submit(job_fn(
            JobProperties::new("j1", format!("scanning {region}")),
            move || {
                let ctx = job_ctx.clone();
                let region = region.clone();
                async move { ctx.send_item(item(&region, 6.0)) }
            },
        ))?;
        ctx.finish_when_idle();
        Ok(())
    }

    async fn re_evaluate(&self, request: ReEvaluate, ctx: ProcessContext) -> SdkResult<()> {
        log::info!("re-evaluating {}", request.id);
        ctx.send_item(item("us-east-1", 8.0))?;
        ctx.results_ready()
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = kaytu::core::logging::init_logging(Some("info"), None, None, false) {
        eprintln!("Failed to initialise logging: {e}");
    }
    if let Err(e) = serve(SamplePlugin).await {
        log::error!("sample plugin stopped: {}", e);
        std::process::exit(1);
    }
}
