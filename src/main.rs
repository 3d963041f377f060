use clap::Parser as ClapParser;
use mcb_rs::debug;
use mcb_rs::image;
use mcb_rs::interpreter::Exec;
use mcb_rs::linker::link;
use mcb_rs::optimizer::optimize;
use mcb_rs::parser::Parser;
use mcbcore::system::System;
use mcbcore::value::Value;
use std::cell::Cell;
use std::fs;
use std::rc::Rc;
use std::time::Instant;

/// Embeddable BASIC compiler and interpreter
#[derive(ClapParser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// BASIC source file
    source: Option<String>,

    /// Run a previously saved image instead of compiling source
    #[arg(long)]
    load: Option<String>,

    /// Save the compiled image to this path
    #[arg(long)]
    save: Option<String>,

    /// Dump the compiled code and string pool, then exit
    #[arg(long, default_value_t = false)]
    dump_code: bool,

    /// Skip the peephole pass
    #[arg(long, default_value_t = false)]
    no_optimize: bool,

    /// Cooperative slice handed to the interpreter per tick
    #[arg(long, default_value_t = 50)]
    interval_ms: u32,
}

/// Demo host bindings: $MILLIS, $LED, SLEEP(ms), ABS(x).
fn bind_demo_host(sys: &mut System) {
    let started = Instant::now();
    let _ = sys.add_register(
        "millis",
        Some(Box::new(move || {
            Ok(Value::Int(started.elapsed().as_millis() as i32))
        })),
        None,
    );

    let led = Rc::new(Cell::new(0i32));
    let led_get = led.clone();
    let _ = sys.add_register(
        "led",
        Some(Box::new(move || Ok(Value::Int(led_get.get())))),
        Some(Box::new(move |value| {
            led.set(value.as_int());
            eprintln!("[led] {}", led.get());
            Ok(())
        })),
    );

    let sleep = sys.sleep.clone();
    let _ = sys.add_service(
        "sleep",
        1,
        Box::new(move |call| {
            let ms = call.arg(0)?.as_int().max(0) as u32;
            sleep.set(ms);
            Ok(Value::Int(0))
        }),
    );

    let _ = sys.add_service(
        "abs",
        1,
        Box::new(|call| match call.arg(0)? {
            Value::Float(v) => Ok(Value::Float(v.abs())),
            value => Ok(Value::Int(value.as_int().wrapping_abs())),
        }),
    );
}

fn main() {
    let args = Args::parse();

    let mut sys = System::new();
    sys.out = Box::new(std::io::stdout());
    bind_demo_host(&mut sys);

    if let Some(path) = &args.load {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                eprintln!("{}", err);
                std::process::exit(1);
            }
        };
        match image::load(&bytes) {
            Ok((code, strings)) => {
                sys.code = code;
                sys.strings = strings;
            }
            Err(err) => {
                eprintln!("{}", err);
                std::process::exit(1);
            }
        }
    } else {
        let Some(path) = &args.source else {
            eprintln!("No source file and no image to load");
            std::process::exit(1);
        };
        let text = match fs::read(path) {
            Ok(text) => text,
            Err(err) => {
                eprintln!("{}", err);
                std::process::exit(1);
            }
        };
        sys.source_from(text);

        let tables = match Parser::new().parse_all(&mut sys) {
            Ok(tables) => tables,
            Err(report) => {
                eprintln!("{}", report);
                std::process::exit(1);
            }
        };
        if let Err(kind) = link(&mut sys, &tables) {
            eprintln!("Link error: {}", kind);
            std::process::exit(1);
        }
        if !args.no_optimize
            && let Err(err) = optimize(&mut sys)
        {
            eprintln!("Optimizer error: {}", err);
            std::process::exit(1);
        }
    }

    if let Some(path) = &args.save {
        let result = fs::File::create(path)
            .map_err(|err| err.to_string())
            .and_then(|mut file| image::save(&sys, &mut file).map_err(|err| err.to_string()));
        if let Err(err) = result {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    }

    if args.dump_code {
        let mut out = std::io::stdout();
        let _ = debug::dump_code(&sys, &mut out);
        let _ = debug::dump_strings(&sys, &mut out);
        return;
    }

    let mut exec = Exec::new();
    loop {
        match exec.task(&mut sys, args.interval_ms) {
            Ok(true) => {
                std::thread::sleep(std::time::Duration::from_millis(args.interval_ms as u64))
            }
            Ok(false) => return,
            Err(err) => {
                eprintln!("Runtime error at pc {}: {}", exec.pc(), err);
                std::process::exit(err.code().abs());
            }
        }
    }
}
