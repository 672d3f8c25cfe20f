use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use colored_json::{
    Color, ColorMode, ColoredFormatter, Output, Paint, PrettyFormatter, Style, Styler,
};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dbus::{BusAddress, Connection, ConnectionConfig, Message, Object};

mod json;

struct Options<'a> {
    address: Option<&'a str>,
    system: bool,
    timeout: Option<u64>,
    should_colorize: bool,
}

fn connect(opts: &Options) -> Result<Connection> {
    let address = match opts.address {
        Some(address) => BusAddress::parse(address)
            .with_context(|| format!("Invalid bus address '{address}'"))?,
        None if opts.system => BusAddress::system()?,
        None => BusAddress::session()?,
    };

    let mut config = ConnectionConfig::default();
    if let Some(secs) = opts.timeout {
        config = config.call_timeout(Some(Duration::from_secs(secs)));
    }

    let conn = Connection::open(&address, config)
        .with_context(|| format!("Failed to connect to '{address}'"))?;
    conn.initialize()
        .with_context(|| format!("Failed to register with the bus at '{address}'"))?;
    debug!("Connected to {} as {:?}", address, conn.unique_name());
    Ok(conn)
}

fn bold_fn(should_colorize: bool) -> fn(w: &str) -> String {
    if should_colorize {
        static BOLD: Style = Style::new().bold();
        |w| w.paint(BOLD).to_string()
    } else {
        |w| w.to_string()
    }
}

fn formatter() -> ColoredFormatter<PrettyFormatter<'static>> {
    ColoredFormatter::with_styler(
        PrettyFormatter::new(),
        Styler {
            key: Color::Cyan.foreground(),
            string_value: Color::Magenta.foreground(),
            integer_value: Color::Magenta.foreground(),
            float_value: Color::Magenta.foreground(),
            bool_value: Color::Magenta.foreground(),
            nil_value: Color::Magenta.foreground(),
            string_include_quotation: false,
            ..Default::default()
        },
    )
}

fn print_json(value: &serde_json::Value, should_colorize: bool) -> Result<()> {
    let color_mode = if should_colorize {
        ColorMode::On
    } else {
        ColorMode::Off
    };
    println!(
        "{}",
        formatter()
            .to_colored_json(value, color_mode)
            .map_err(|e| anyhow!("Failed to print json for '{value}': {e}"))?
    );
    Ok(())
}

fn dbus_info(opts: &Options) -> Result<()> {
    let bold = bold_fn(opts.should_colorize);
    let conn = connect(opts)?;

    let names = conn.list_names().context("Failed to list bus names")?;

    println!("{} {}", bold("Address:"), conn.address());
    println!("{} {}", bold("Unique Name:"), conn.unique_name().unwrap_or("-"));
    println!("{} {}", bold("GUID:"), conn.guid().unwrap_or("-"));
    println!("{}", bold("Names:"));
    for name in names {
        println!("  {}", name);
    }
    Ok(())
}

fn dbus_introspect(opts: &Options, destination: &str, path: &str, as_json: bool) -> Result<()> {
    let conn = connect(opts)?;
    let introspection = conn
        .introspect(destination, path)
        .with_context(|| format!("Failed to introspect '{destination}' at '{path}'"))?;

    if as_json {
        let value = serde_json::to_value(&introspection)
            .with_context(|| format!("Failed to convert '{destination}' to json"))?;
        return print_json(&value, opts.should_colorize);
    }

    let bold = bold_fn(opts.should_colorize);
    println!("{} {} {}", bold("Object"), destination, path);
    println!();
    print!("{}", introspection);
    Ok(())
}

fn dbus_call(
    opts: &Options,
    destination: &str,
    path: &str,
    method: &str,
    args: Option<&str>,
) -> Result<()> {
    let (interface, member) = method
        .rsplit_once('.')
        .ok_or_else(|| anyhow!("Invalid method '{method}', expected INTERFACE.METHOD"))?;

    let conn = connect(opts)?;
    let introspection = conn
        .introspect(destination, path)
        .with_context(|| format!("Failed to introspect '{destination}' at '{path}'"))?;
    let object = Object::new(destination, path, introspection);

    let iface = conn
        .interface(&object, interface)
        .ok_or_else(|| anyhow!("Interface '{interface}' not found at '{path}'"))?;
    let signature = iface
        .method(member)
        .ok_or_else(|| anyhow!("Method '{method}' not found"))?
        .in_signature();
    let values = json::to_args(&signature, args)?;

    let mut reply: Option<Message> = None;
    match conn.call_method(&iface, member, &values, |msg| reply = Some(msg)) {
        Ok(()) => {}
        Err(dbus::Error::MethodError { name, message }) => {
            let red: fn(w: &str) -> String = if opts.should_colorize {
                |w| w.paint(Color::Red.foreground()).to_string()
            } else {
                |w| w.to_string()
            };
            return Err(anyhow!("Call failed with error: {}: {}", red(&name), message));
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to call method '{method}({})'", args.unwrap_or(""))
            })
        }
    }

    let reply = reply.ok_or_else(|| anyhow!("No reply for '{method}'"))?;
    print_json(&json::from_body(&reply.body), opts.should_colorize)
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn cli() -> Command {
    Command::new("dbus")
        .version(VERSION)
        .about("Talk to services on a D-Bus message bus")
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("print debug"),
        )
        .arg(
            Arg::new("color")
                .long("color")
                .value_parser(["on", "off", "auto"])
                .default_value("auto")
                .help("colorize output"),
        )
        .arg(
            Arg::new("system")
                .long("system")
                .action(ArgAction::SetTrue)
                .conflicts_with("address")
                .help("connect to the system bus instead of the session bus"),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("ADDRESS")
                .help("connect to the bus at ADDRESS")
                .long_help(
                    "Connect to the bus at ADDRESS, for example 'unix:path=/run/user/1000/bus'. \
                     Defaults to $DBUS_SESSION_BUS_ADDRESS.",
                ),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .help("time in seconds to wait for a reply"),
        )
        .subcommand(
            Command::new("info")
                .about("Print information about the bus")
                .long_about("Prints the unique name, the server guid and all names on the bus."),
        )
        .subcommand(
            Command::new("introspect")
                .about("Print the interfaces of an object")
                .arg(Arg::new("DESTINATION").required(true))
                .arg(Arg::new("PATH").required(true))
                .arg(
                    Arg::new("json")
                        .short('j')
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("print the introspection data as JSON"),
                ),
        )
        .subcommand(
            Command::new("call")
                .about("Call a method")
                .long_about(
                    "Call METHOD of the object at PATH owned by DESTINATION. ARGUMENTS must be \
                     a JSON array with one element per input argument; a single argument may \
                     be given on its own.",
                )
                .arg(Arg::new("DESTINATION").required(true))
                .arg(Arg::new("PATH").required(true))
                .arg(
                    Arg::new("METHOD")
                        .value_name("INTERFACE.METHOD")
                        .required(true),
                )
                .arg(Arg::new("ARGUMENTS").required(false)),
        )
}

fn main() {
    let mut app = cli();
    let matches = app.clone().get_matches();

    let color = matches
        .get_one::<String>("color")
        .map(String::as_str)
        .unwrap_or("auto");
    let should_colorize = match color {
        "on" => true,
        "off" => false,
        _ => ColorMode::should_colorize(Output::StdOut),
    };
    let debug = matches.get_flag("debug");
    init_logging(debug);

    if let Err(e) = do_main(&mut app, &matches, should_colorize) {
        let red_bold: fn(w: &str) -> String = if should_colorize {
            |w| w.paint(Color::Red.bold()).to_string()
        } else {
            |w| w.to_string()
        };

        if debug {
            eprintln!("{:?}", e);
        } else {
            eprintln!("{} {:#}", red_bold("Error:"), e);
        }
        std::process::exit(1);
    }
}

fn do_main(app: &mut Command, matches: &ArgMatches, should_colorize: bool) -> Result<()> {
    let opts = Options {
        address: matches.get_one::<String>("address").map(String::as_str),
        system: matches.get_flag("system"),
        timeout: matches.get_one::<u64>("timeout").copied(),
        should_colorize,
    };

    fn required<'a>(m: &'a ArgMatches, name: &str) -> Result<&'a str> {
        m.get_one::<String>(name)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("Missing {name}"))
    }

    match matches.subcommand() {
        Some(("info", _)) => dbus_info(&opts)?,
        Some(("introspect", sub_matches)) => dbus_introspect(
            &opts,
            required(sub_matches, "DESTINATION")?,
            required(sub_matches, "PATH")?,
            sub_matches.get_flag("json"),
        )?,
        Some(("call", sub_matches)) => dbus_call(
            &opts,
            required(sub_matches, "DESTINATION")?,
            required(sub_matches, "PATH")?,
            required(sub_matches, "METHOD")?,
            sub_matches.get_one::<String>("ARGUMENTS").map(String::as_str),
        )?,
        _ => {
            app.print_help().context("Couldn't print help")?;
            println!();
        }
    }
    Ok(())
}
