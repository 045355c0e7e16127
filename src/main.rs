use clap::Parser;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleeting_plugin_proxmox::grpc::InstanceGroupServiceImpl;
use fleeting_plugin_proxmox::pb::instance_group_service_server::InstanceGroupServiceServer;

const LICENSES: &str = include_str!("../LICENSES.txt");

#[derive(Parser)]
#[command(name = "fleeting-plugin-proxmox", disable_version_flag = true)]
#[command(about = "GitLab fleeting plugin that autoscales a VM fleet on Proxmox VE")]
struct Args {
    /// gRPC listen address
    #[arg(short, long, default_value = "[::1]:50061")]
    listen: String,

    /// Print version information and exit
    #[arg(short = 'V', long)]
    version: bool,

    /// Print third-party licence information and exit
    #[arg(long)]
    licenses: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("fleeting_plugin_proxmox=info".parse()?),
        )
        .init();

    let args = Args::parse();

    if args.version {
        println!("fleeting-plugin-proxmox {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if args.licenses {
        println!("{LICENSES}");
        return Ok(());
    }

    let service = InstanceGroupServiceImpl::new();

    let addr = args.listen.parse()?;
    info!(addr = %addr, "starting fleeting-plugin-proxmox gRPC server");

    Server::builder()
        .add_service(InstanceGroupServiceServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
