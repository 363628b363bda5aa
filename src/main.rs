use std::time::Duration;

use il2cpp_netcap::backend::find_process_by_name;
use il2cpp_netcap::channel::transport::listen;
use il2cpp_netcap::controller::Controller;
use il2cpp_netcap::logging;
use il2cpp_netcap::sink::DumpDirSink;
use il2cpp_netcap::{ControllerConfig, NetcapError};

const PROCESS_POLL: Duration = Duration::from_millis(500);

async fn wait_for_process(name: &str) {
    tracing::info!(process = name, "waiting for process");
    loop {
        let lookup = name.to_string();
        let found = tokio::task::spawn_blocking(move || find_process_by_name(&lookup))
            .await
            .ok()
            .flatten();
        if let Some(pid) = found {
            tracing::info!(process = name, %pid, "found process");
            return;
        }
        tokio::time::sleep(PROCESS_POLL).await;
    }
}

async fn run() -> Result<(), NetcapError> {
    let config = ControllerConfig::load()?;

    if config.wait_for_process {
        wait_for_process(&config.process_name).await;
    }

    let sink = DumpDirSink::create(&config.dump_dir)?;
    tracing::info!(dir = %sink.dir().display(), "writing captures");
    let controller = Controller::new(sink, config.recent_captures);

    #[cfg(feature = "status-server")]
    if let Some(addr) = config.status_addr.clone() {
        let state = controller.state();
        tokio::spawn(async move {
            if let Err(err) = il2cpp_netcap::status::serve(&addr, state).await {
                tracing::warn!(error = %err, "status server stopped");
            }
        });
    }

    let (_addr, rx) = listen(&config.listen_addr, config.queue_capacity).await?;
    controller.run(rx).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    logging::init_controller();

    if let Err(err) = run().await {
        tracing::error!(error = %err, "controller failed");
        std::process::exit(1);
    }
}
