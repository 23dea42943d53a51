use anyhow::{bail, Context, Result};
use std::io::Write;
use std::iter::Peekable;
use std::str::{FromStr, SplitWhitespace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eltako_bus::transport::DEFAULT_BAUD_RATE;
use eltako_bus::{
    BusAddress, Command, Event, Master, MasterConfig, RowData, SerialConnector, Transport,
    TransportConfig,
};

fn cmd_scan(args: &mut CmdScanner, bus: &Master) -> Result<()> {
    let first = args.parse_next_or(1u8)?;
    let last = args.parse_next_or(127u8)?;
    for step in bus.scan_range(BusAddress::new(first)?, BusAddress::new(last)?) {
        if let Ok(device) = step.outcome {
            println!("{}", device);
        }
    }
    Ok(())
}

fn cmd_devices(bus: &Master) -> Result<()> {
    for device in bus.devices() {
        println!("{}", device);
    }
    Ok(())
}

fn cmd_read(args: &mut CmdScanner, bus: &Master) -> Result<()> {
    let device = bus.discover(args.address()?)?;
    let session = bus.unlock_memory(&device)?;
    match args.parse_next::<i64>() {
        Ok(row) => println!("{:3}: {}", row, eltako_bus::Hex(&session.read_row(row)?)),
        Err(_) => {
            for (row, data) in session.read_all()?.iter().enumerate() {
                println!("{:3}: {}", row, eltako_bus::Hex(data));
            }
        }
    }
    session.lock()?;
    Ok(())
}

fn cmd_write(args: &mut CmdScanner, bus: &Master) -> Result<()> {
    let device = bus.discover(args.address()?)?;
    let row: i64 = args.parse_next()?;
    let bytes = args.hex_bytes()?;
    let value: RowData = bytes
        .as_slice()
        .try_into()
        .context("A row has 8 bytes")?;
    let session = bus.unlock_memory(&device)?;
    session.write_row(row, value)?;
    session.lock()?;
    Ok(())
}

fn cmd_assign(args: &mut CmdScanner, bus: &Master) -> Result<()> {
    let target = match args.next() {
        Ok(text) => Some(Master::parse_address(text)?),
        Err(_) => None,
    };
    let reply = bus.enter_address_mode()?;
    println!("Found device in learning mode, size {}", reply.size);
    match bus.assign(target) {
        Ok(device) => println!("{}", device),
        Err(e) => {
            bus.exit_address_mode();
            return Err(e.into());
        }
    }
    Ok(())
}

fn cmd_poll(args: &mut CmdScanner, bus: &Master) -> Result<()> {
    let status = bus.poll_status(args.address()?)?;
    let telegram = eltako_bus::Telegram::BusStatus(status);
    match bus.interpret(&telegram)? {
        Some((device, reading)) => println!("{}: {}", device, reading),
        None => println!("{}", telegram),
    }
    Ok(())
}

/// `switch <address> <channel> on|off`, programming the channel first if needed.
fn cmd_switch(args: &mut CmdScanner, bus: &Master) -> Result<()> {
    let device = bus.discover(args.address()?)?;
    let channel: u8 = args.parse_next()?;
    let on = match args.next()? {
        "on" | "1" => true,
        "off" | "0" => false,
        other => bail!("Expected on or off, got {}", other),
    };
    let session = bus.unlock_memory(&device)?;
    let command = session.ensure_direct_command(channel)?;
    session.lock()?;
    bus.set_state(&command, &Command::Switch { on })?;
    println!("Sent as {}", command.sender());
    Ok(())
}

fn cmd_raw(args: &mut CmdScanner, bus: &Master) -> Result<()> {
    let telegram = bus.send_raw(&args.hex_bytes()?)?;
    println!("Sent {}", telegram);
    Ok(())
}

fn cmd_monitor(monitoring: &AtomicBool) -> Result<()> {
    println!("Press enter to stop monitoring.");
    monitoring.store(true, Ordering::Relaxed);
    let mut buf = String::new();
    std::io::stdin().read_line(&mut buf)?;
    monitoring.store(false, Ordering::Relaxed);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args();
    args.next(); // Skip program name
    let port = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let baud_rate = match args.next() {
        Some(rate) => rate.parse().context("Invalid baud rate")?,
        None => DEFAULT_BAUD_RATE,
    };

    let transport = Transport::start(
        SerialConnector::new(port, baud_rate),
        TransportConfig::default(),
    )?;
    let monitoring = Arc::new(AtomicBool::new(false));
    {
        let monitoring = Arc::clone(&monitoring);
        transport.subscribe_events(move |event| {
            if !monitoring.load(Ordering::Relaxed) {
                return;
            }
            match event {
                Event::TelegramReceived(t) => println!("<< {}", t),
                Event::DeviceDiscovered(d) => println!("** {}", d),
                Event::ConnectionStateChanged(s) => println!("-- {:?}", s),
            }
        });
    }
    let bus = Master::new(transport, MasterConfig::default());

    let mut stdout = std::io::stdout();
    let mut cmd = String::new();
    loop {
        print!(">> ");
        stdout.flush()?;
        let mut scan = CmdScanner::read_stdin(&mut cmd)?;
        if let Err(err) = match scan.next() {
            Err(_) => continue,
            Ok("quit") | Ok("q") => break,
            Ok("scan") => cmd_scan(&mut scan, &bus),
            Ok("devices") => cmd_devices(&bus),
            Ok("read") | Ok("r") => cmd_read(&mut scan, &bus),
            Ok("write") | Ok("w") => cmd_write(&mut scan, &bus),
            Ok("assign") => cmd_assign(&mut scan, &bus),
            Ok("lock") => bus.lock_bus().map(|_| ()).map_err(Into::into),
            Ok("unlock") => bus.unlock_bus().map(|_| ()).map_err(Into::into),
            Ok("poll") => cmd_poll(&mut scan, &bus),
            Ok("identify") => scan
                .address()
                .and_then(|a| bus.identify(a).map_err(Into::into)),
            Ok("switch") | Ok("s") => cmd_switch(&mut scan, &bus),
            Ok("raw") => cmd_raw(&mut scan, &bus),
            Ok("monitor") | Ok("m") => cmd_monitor(&monitoring),
            Ok(cmd) => {
                println!("Unknown command {}", cmd);
                continue;
            }
        } {
            println!("{:?}", err)
        }
    }
    Ok(())
}

struct CmdScanner<'a> {
    splt: Peekable<SplitWhitespace<'a>>,
}

impl<'a> CmdScanner<'a> {
    fn read_stdin(buf: &'a mut String) -> Result<Self> {
        buf.clear();
        if std::io::stdin().read_line(buf)? == 0 {
            bail!("End of input");
        }
        let splt = buf.split_whitespace().peekable();
        Ok(Self { splt })
    }
    fn next(&mut self) -> Result<&str> {
        self.splt.next().context("End of stream")
    }
    fn parse_next<T: FromStr>(&mut self) -> Result<T> {
        self.next()?.parse::<T>().ok().context("Parse error")
    }
    fn parse_next_or<T: FromStr>(&mut self, default: T) -> Result<T> {
        match self.splt.peek() {
            Some(_) => self.parse_next(),
            None => Ok(default),
        }
    }
    fn address(&mut self) -> Result<BusAddress> {
        Ok(Master::parse_address(self.next()?)?)
    }
    /// The remaining arguments as hex bytes, separated or not.
    fn hex_bytes(&mut self) -> Result<Vec<u8>> {
        let digits: String = self.splt.by_ref().collect();
        if digits.len() % 2 != 0 {
            bail!("Odd number of hex digits");
        }
        (0..digits.len())
            .step_by(2)
            .map(|i| {
                let pair = digits.get(i..i + 2).context("Invalid hex")?;
                u8::from_str_radix(pair, 16).context("Invalid hex")
            })
            .collect()
    }
}
