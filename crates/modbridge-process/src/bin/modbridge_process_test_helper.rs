use std::{
    env,
    io::{self, BufRead, Write},
    process, thread,
    time::Duration,
};

fn parse_u64(value: Option<String>, flag: &str) -> u64 {
    let value = value.unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    });
    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid u64 for {flag}: {value}");
        process::exit(2);
    })
}

fn spawn_child_sleep(ms: u64) {
    let exe = env::current_exe().unwrap_or_else(|err| {
        eprintln!("failed to resolve current exe: {err}");
        process::exit(2);
    });

    let child = process::Command::new(exe)
        .args(["--sleep-ms", &ms.to_string()])
        .spawn()
        .unwrap_or_else(|err| {
            eprintln!("failed to spawn child: {err}");
            process::exit(2);
        });
    println!("child {}", child.id());
}

fn echo_stdin() {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let _ = writeln!(stdout, "echo: {line}");
        let _ = stdout.flush();
    }
}

fn main() {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sleep-ms" => {
                let ms = parse_u64(args.next(), "--sleep-ms");
                thread::sleep(Duration::from_millis(ms));
            }
            "--spawn-child-sleep-ms" => {
                let ms = parse_u64(args.next(), "--spawn-child-sleep-ms");
                spawn_child_sleep(ms);
            }
            "--echo-stdin" => echo_stdin(),
            "--print-pgid" => {
                #[cfg(unix)]
                unsafe {
                    println!("pid {} pgid {}", libc::getpid(), libc::getpgrp());
                }
            }
            "--stderr" => {
                let text = args.next().unwrap_or_default();
                eprintln!("{text}");
            }
            "--exit-code" => {
                let code = parse_u64(args.next(), "--exit-code");
                process::exit(code as i32);
            }
            other => {
                eprintln!("unknown argument: {other}");
                process::exit(2);
            }
        }
        let _ = io::stdout().flush();
    }
}
