mod shell;

use crate::shell::{new_shell, ShellWrite};
use ansi_term::Colour::{Fixed, Green, Yellow};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use rpassword::read_password;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use source_rcon_client::{
    connect, Client, ClientConfig, ConnectionState, ErrorKind, PacketType, DEFAULT_PORT,
};
use std::io::Write;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Address of the server, e.g. `127.0.0.1:27015`. The port defaults to 27015.
    address: String,

    /// Command to run once instead of opening a console.
    command: Vec<String>,

    /// RCON password. Prompted for when omitted.
    #[clap(short, long)]
    password: Option<String>,

    /// Seconds to wait for each answer. 0 waits forever.
    #[clap(long, default_value_t = 5.0)]
    timeout: f64,

    /// Do not reconnect when the connection drops.
    #[clap(long)]
    no_retry: bool,

    /// Reconnect attempts before giving up.
    #[clap(long, default_value_t = 3)]
    reconnect_attempts: u32,

    /// Seconds between reconnect attempts.
    #[clap(long, default_value_t = 1.0)]
    reconnect_delay: f64,

    /// The server answers concurrent requests safely, so background commands collect their
    /// answers.
    #[clap(long)]
    concurrent_reads: bool,

    /// Log protocol traffic.
    #[clap(short, long)]
    verbose: bool,

    /// Read commands from stdin line by line, without an editable prompt.
    #[clap(long)]
    no_interactive: bool,
}

impl Args {
    fn config(&self) -> ClientConfig {
        ClientConfig::new()
            .with_timeout_seconds(self.timeout)
            .with_retry_connect(!self.no_retry)
            .with_reconnect_attempts(self.reconnect_attempts)
            .with_reconnect_delay_seconds(self.reconnect_delay)
            .with_concurrent_reads(self.concurrent_reads)
    }
}

/// Splits `host[:port]`, accepting bare and bracketed IPv6 addresses.
fn parse_address(address: &str) -> Option<(String, u16)> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Some((addr.ip().to_string(), addr.port()));
    }
    if address.parse::<std::net::Ipv6Addr>().is_ok() {
        return Some((address.to_string(), DEFAULT_PORT));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None if address.is_empty() => None,
        None => Some((address.to_string(), DEFAULT_PORT)),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto)
        .expect("logger is only initialised once");

    let (host, port) = match parse_address(&args.address) {
        Some(parts) => parts,
        None => {
            eprintln!("Invalid address: {}", args.address);
            proc_exit::Code::FAILURE.process_exit();
        }
    };

    let password = match &args.password {
        Some(password) => password.clone(),
        None => {
            print!("{}:{}'s password: ", host, port);
            std::io::stdout().flush().ok();
            match read_password() {
                Ok(password) => password,
                Err(err) => {
                    eprintln!("Could not read password: {}", err);
                    proc_exit::Code::FAILURE.process_exit();
                }
            }
        }
    };

    let client = match connect(&host, port, &password, args.config()).await {
        Ok(client) => client,
        Err(err) if err.kind() == ErrorKind::Authentication => {
            error!("Invalid password.");
            proc_exit::Code::FAILURE.process_exit();
        }
        Err(err) => {
            error!("Connection failed: {}", err);
            proc_exit::Code::FAILURE.process_exit();
        }
    };

    if !args.command.is_empty() {
        let answer = client.send_command(&args.command.join(" ")).await;
        println!("{}", answer.trim_end());
        client.dispose().await;
        proc_exit::Code::SUCCESS.process_exit();
    }

    info!(
        "Connected. View builtins with `!help`. {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let prompt = format!("{}> ", Fixed(10).paint(format!("{}:{}", host, port)));
    let (mut shell_read, mut shell_write) = new_shell(prompt, args.no_interactive);

    while let Some(line) = shell_read.read_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let keep_going = match line.strip_prefix('!') {
            Some(builtin) => run_builtin(&client, builtin, &mut shell_write).await,
            None => {
                let answer = client.send_command(line).await;
                print_answer(&mut shell_write, &answer);
                true
            }
        };

        if !keep_going {
            break;
        }

        if client.state() == ConnectionState::Closed {
            error!("Connection closed, giving up.");
            proc_exit::Code::FAILURE.process_exit();
        }
    }

    client.dispose().await;
    proc_exit::Code::SUCCESS.process_exit();
}

fn print_answer(shell_write: &mut ShellWrite, answer: &str) {
    let answer = answer.trim_end();
    if !answer.is_empty() {
        writeln!(shell_write.out(), "{}", answer).ok();
    }
}

/// Runs a `!` builtin. Returns `false` when the console should exit.
async fn run_builtin(client: &Client, builtin: &str, shell_write: &mut ShellWrite) -> bool {
    let (name, rest) = builtin.split_once(' ').unwrap_or((builtin, ""));
    let rest = rest.trim();

    match name {
        "help" => {
            let out = shell_write.out();
            writeln!(
                out,
                "{} {}",
                Green.paint(env!("CARGO_PKG_NAME")),
                env!("CARGO_PKG_VERSION")
            )
            .ok();
            writeln!(out).ok();
            writeln!(out, "{}", Yellow.paint("BUILTINS")).ok();
            writeln!(out, "    !help                 View this help listing").ok();
            writeln!(out, "    !state                Show the connection state").ok();
            writeln!(
                out,
                "    !msg {}    Send a packet of a raw type",
                Green.paint("<TYPE> <TEXT>")
            )
            .ok();
            writeln!(
                out,
                "    !bg {}         Run a command without waiting",
                Green.paint("<COMMAND>")
            )
            .ok();
            writeln!(out, "    !quit                 Leave the console").ok();
            writeln!(
                out,
                "    {}   Run a command on the server",
                Green.paint("<COMMAND> [ARGS...]")
            )
            .ok();
        }
        "state" => {
            writeln!(
                shell_write.out(),
                "{:?} ({} reconnect attempts so far)",
                client.state(),
                client.reconnect_count()
            )
            .ok();
        }
        "msg" => {
            let (code, text) = rest.split_once(' ').unwrap_or((rest, ""));
            match code.parse::<i32>() {
                Ok(code) => {
                    let answer = client.send_message(PacketType::new(code), text).await;
                    print_answer(shell_write, &answer);
                }
                Err(_) => {
                    writeln!(shell_write.err(), "Packet type must be a number.").ok();
                }
            }
        }
        "bg" if !rest.is_empty() => {
            drop(client.fire_and_forget(PacketType::EXEC_COMMAND, rest));
        }
        "quit" | "exit" => return false,
        _ => {
            warn!("Unknown builtin `!{}`.", name);
        }
    }

    true
}
