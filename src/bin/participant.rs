//! A participant that pulls the global model towards a constant target, for trying out a
//! coordinator.

use std::{cmp, net::SocketAddr, process};

use structopt::StructOpt;
use tracing_subscriber::*;

use fedavg_server::{
    client::Participant,
    message::{MessageCodec, DEFAULT_MAX_MESSAGE_SIZE},
    model::Model,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Participant")]
struct Opt {
    /// Address of the coordinator
    #[structopt(short, long, default_value = "127.0.0.1:5000")]
    address: SocketAddr,

    /// Identity announced to the coordinator
    #[structopt(short, long)]
    id: String,

    /// Value every weight is trained towards
    #[structopt(short, long, default_value = "1.0")]
    target: f64,

    /// Number of local samples
    #[structopt(short, long, default_value = "100")]
    samples: u64,

    /// Width of the frame header, must match the coordinator
    #[structopt(long, default_value = "10")]
    header_width: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = Opt::from_args();

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .init();

    let max_message_size = cmp::min(
        DEFAULT_MAX_MESSAGE_SIZE,
        10_usize.saturating_pow(opt.header_width as u32) - 1,
    );
    let codec = MessageCodec::new(opt.header_width, max_message_size);
    let participant = Participant::connect(opt.address, opt.id, codec)
        .await
        .unwrap_or_else(|err| {
            error!("{}", err);
            process::exit(1);
        });

    let (target, samples) = (opt.target, opt.samples);
    let result = participant
        .train(|global: &Model| {
            let local = global.iter().map(|w| w + 0.5 * (target - w)).collect();
            (vec![local], vec![samples])
        })
        .await;
    match result {
        Ok(model) => info!("final global model: {:?}", model),
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    }
}
