use clap::{App,Arg};

pub fn get_app() -> App<'static, 'static> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Block I/O trace life-cycle analyzer")
        .arg(
            Arg::with_name("input")
                .short("i")
                .long("input")
                .value_name("FILE")
                .help("Binary trace stream to read (defaults to stdin)")
                .takes_value(true)
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .value_name("PREFIX")
                .help("Prefix for all output files (reports go to stdout without it)")
                .takes_value(true)
        )
        .arg(
            Arg::with_name("devices")
                .short("d")
                .long("device")
                .value_name("MAJ,MIN")
                .help("Restrict analysis to this device. Can be specified multiple times.")
                .takes_value(true)
                .number_of_values(1)
                .multiple(true)
        )
        .arg(
            Arg::with_name("exes")
                .short("e")
                .long("exe")
                .value_name("NAME")
                .help("Restrict analysis to I/O queued by this command. Can be specified multiple times.")
                .takes_value(true)
                .number_of_values(1)
                .multiple(true)
        )
        .arg(
            Arg::with_name("dev-map")
                .short("M")
                .long("dev-map")
                .value_name("FILE")
                .help("Device map file used to annotate report rows")
                .takes_value(true)
        )
        .arg(
            Arg::with_name("iostat-interval")
                .short("I")
                .long("iostat-interval")
                .value_name("NANOSECONDS")
                .help("Interval between iostat snapshots (0 disables them)")
                .takes_value(true)
        )
        .arg(
            Arg::with_name("range-delta")
                .short("r")
                .long("range-delta")
                .value_name("NANOSECONDS")
                .help("Idle gap that separates active ranges")
                .takes_value(true)
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Dump every I/O node when its graph is released")
                .takes_value(false)
        )
        .arg(
            Arg::with_name("dump-level")
                .short("l")
                .long("dump-level")
                .value_name("LEVEL")
                .help("Artifacts to emit: 0 averages, 1 adds ranges and seeks, 2 adds latency streams")
                .takes_value(true)
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("Load the whole configuration from a YAML file (flags override)")
                .takes_value(true)
        )
}
