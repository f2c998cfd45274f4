use std::{
    collections::VecDeque,
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use clap::Parser;
use rand::{seq::SliceRandom, thread_rng, Rng};
use tracing::{info, warn};
use vtnflow::{
    common::{MacVlan, MemberId, NodeId, SwitchPort},
    config::Config,
    flow::{FlowAction, FlowMatch, L2Host},
    flowdb::FlowRemover,
    simulated::Cluster,
    task::{FlowModFuture, FlowModResult},
    wait::Interrupt,
};

#[derive(Parser, Debug)]
#[clap(name = "VTN flow simulator", version)]
struct Args {
    #[clap(short, long, default_value_t = 3)]
    members: usize,
    #[clap(short, long, default_value_t = 12)]
    switches: u64,
    #[clap(short, long, default_value_t = 200)]
    flows: usize,
    #[clap(short, long, default_value_t = 4)]
    tenants: usize,
    /// Java properties file with the flow engine parameters.
    #[clap(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// Probability to drop one cluster message.
    #[clap(long, default_value_t = 0.)]
    drop_rate: f64,
    /// Upper bound of the random cluster message delay, in milliseconds.
    #[clap(long, default_value_t = 0)]
    delay: u64,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{}", err);
                process::exit(1);
            }
        },
        None => Config::default(),
    };
    info!("{:?}", config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let set_handler = ctrlc::set_handler({
        let shutdown = shutdown.clone();
        move || {
            println!();
            if !shutdown.load(Ordering::SeqCst) {
                shutdown.store(true, Ordering::SeqCst);
            } else {
                warn!("double ctrl-c, quit ungracefully");
                process::abort();
            }
        }
    });
    if let Err(err) = set_handler {
        warn!("cannot install ctrl-c handler: {}", err);
    }

    let members = args.members.max(1);
    let mut cluster = Cluster::new("default", members, config.clone());
    for node in 1..=args.switches.max(1) {
        cluster.connect(NodeId(node), (node % members as u64) as MemberId);
    }
    if args.drop_rate > 0. {
        let drop_rate = args.drop_rate;
        cluster.insert_filter(1, move |_, _, _, _| !thread_rng().gen_bool(drop_rate.min(1.)));
    }
    if args.delay > 0 {
        cluster.insert_filter(2, Cluster::delay(Duration::ZERO, Duration::from_millis(args.delay)));
    }

    let nodes: Vec<_> = (1..=args.switches.max(1)).map(NodeId).collect();
    // add tasks block a worker while their entry tasks run on the same pool,
    // keep enough workers free
    let window = (config.task_pool_size as usize / 2).max(1);
    let interrupt = Interrupt::default();
    let start = Instant::now();
    let mut pending = VecDeque::new();
    let (mut installed, mut succeeded, mut failed, mut rejected) = (0, 0, 0, 0);
    let mut settle = |future: Arc<FlowModFuture>| match future.result(None, &interrupt) {
        FlowModResult::Succeeded => succeeded += 1,
        _ => failed += 1,
    };
    for i in 0..args.flows {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let mut rng = thread_rng();
        let length = rng.gen_range(1..=nodes.len().min(4));
        let path: Vec<_> = nodes.choose_multiple(&mut rng, length).copied().collect();
        // the member owning the ingress switch installs the flow
        let member = (path[0].0 % members as u64) as MemberId;
        let manager = cluster.member(member).manager.clone();
        let tenant = format!("vtn{}", i % args.tenants.max(1));
        let vlan = rng.gen_range(0..4096);
        let mut flow = manager.new_flow(&tenant).with_hosts(
            L2Host {
                host: MacVlan::new(rng.gen::<u32>() as u64, vlan),
                port: SwitchPort::new(path[0], 1),
            },
            L2Host {
                host: MacVlan::new(rng.gen::<u32>() as u64, vlan),
                port: SwitchPort::new(path[length - 1], 2),
            },
        );
        let dst_mac = flow.egress_host.map(|egress| egress.host.mac);
        for node in &path {
            flow.add_entry(
                *node,
                FlowMatch {
                    vlan: Some(vlan),
                    dst_mac,
                    ..Default::default()
                },
                vec![FlowAction::Output(2)],
                manager.config().l2_flow_priority(),
            );
        }
        match manager.install_flow(flow) {
            Ok(future) => {
                installed += 1;
                pending.push_back(future);
            }
            Err(err) => {
                warn!("{}", err);
                rejected += 1;
            }
        }
        while pending.len() >= window {
            if let Some(future) = pending.pop_front() {
                settle(future);
            }
        }
    }
    for future in pending {
        settle(future);
    }
    drop(settle);
    println!(
        "installed {} flows in {:?}: {} succeeded, {} failed, {} rejected",
        installed,
        start.elapsed(),
        succeeded,
        failed,
        rejected
    );
    println!(
        "cached flows {}, installed entries {}",
        cluster.cache().len(),
        cluster.installed().len()
    );

    let start = Instant::now();
    let removals: Vec<_> = (0..args.tenants.max(1))
        .map(|tenant| {
            // any member may remove, the cache is shared
            let member = (tenant % members) as MemberId;
            cluster
                .member(member)
                .manager
                .remove_flows(FlowRemover::Tenant(format!("vtn{}", tenant)))
        })
        .collect();
    for removal in removals {
        let _: FlowModResult = removal.result(None, &interrupt);
    }
    println!(
        "removed every tenant in {:?}, installed entries left {}",
        start.elapsed(),
        cluster.installed().len()
    );

    for member in cluster.members() {
        let latency = member.manager.pool().latency();
        println!(
            "member {}: {} tasks, mean {:?}, p99 {:?}, max {:?}",
            member.manager.member(),
            latency.count,
            latency.mean,
            latency.p99,
            latency.max
        );
    }
    cluster.shutdown(Duration::from_secs(1));
}
