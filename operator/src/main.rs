//! Runs the VPSie cluster autoscaler control plane

#[macro_use]
extern crate serde_derive;

use clap::Parser;

mod args;
mod libs;

#[tokio::main]
async fn main() {
    // install a crypto provider for rustls
    // Rustls will complain if this is not run but we can ignore any errors
    // https://github.com/rustls/rustls/issues/1938
    let _ = rustls::crypto::ring::default_provider().install_default();
    // load command line args
    let args = args::Args::parse();
    // try to load a config file
    let conf = vpsie_autoscaler::Conf::new(&args.config).expect("Failed to load config");
    // setup our tracer
    libs::trace::setup(conf.autoscaler.log_level);
    // execute the right handler
    match &args.cmd {
        // start the controllers
        args::SubCommands::Run(run) => libs::controller::run(&conf, run)
            .await
            .expect("Controller crashed"),
        // print our CRDs as yaml
        args::SubCommands::Crds => libs::crds::print().expect("Failed to render CRDs"),
    }
}
