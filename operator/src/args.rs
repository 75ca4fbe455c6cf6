use clap::Parser;

/// The command line args to pass to the autoscaler operator
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "vpsie-autoscaler.yml")]
    pub config: String,
    /// The subcommand to execute
    #[clap(subcommand)]
    pub cmd: SubCommands,
}

/// The subcommands the operator supports
#[derive(Parser, Debug, Clone)]
pub enum SubCommands {
    /// Run the autoscaler controllers
    Run(RunArgs),
    /// Print the autoscaler CRDs as yaml
    Crds,
}

/// The args for running the autoscaler controllers
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Skip applying our CRDs on startup
    #[clap(long, default_value_t)]
    pub skip_crds: bool,
    /// Disable leader election and always run the controllers
    ///
    /// Only safe when a single replica is deployed.
    #[clap(long, default_value_t)]
    pub no_leader_election: bool,
}
