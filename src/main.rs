// Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs the field/attribute runtime's command server: loads the three
//! config-directory files into a [`fields::Runtime`], then accepts client
//! command streams over TCP, one thread per connection, per spec.md §5's
//! "one thread per client command stream" scheduling model.

use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use anyhow::Result;
use argh::FromArgs;
use base::error;
use base::info;
use fields::dispatch::Dispatcher;
use fields::dispatch::Session;
use fields::hardware::mock::MockHardware;
use fields::Runtime;

#[derive(FromArgs)]
/// PandA field/attribute runtime command server.
struct Args {
    /// directory containing the `config`, `registers`, and `description`
    /// files the database loader reads at start-up
    #[argh(option, arg_name = "PATH")]
    config_dir: PathBuf,

    /// TCP port to accept client command streams on
    #[argh(option, arg_name = "PORT", default = "8888")]
    port: u16,
}

fn handle_connection(runtime: Arc<Runtime>, stream: TcpStream) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "<unknown>".to_string());
    info!("client connected: {peer}");
    let dispatcher = Dispatcher::new(runtime);
    let mut session = Session::new();
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            error!("failed to clone stream for {peer}: {e}");
            return;
        }
    };
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                error!("read error from {peer}: {e}");
                break;
            }
        };
        if let Some(response) = dispatcher.handle_line(&mut session, &line) {
            if writer.write_all(response.as_bytes()).is_err() {
                break;
            }
        }
    }
    dispatcher.abort_pending(&mut session);
    info!("client disconnected: {peer}");
}

fn run(args: Args) -> Result<()> {
    let hw = Arc::new(MockHardware::new());
    let runtime = Arc::new(
        Runtime::load_from_dir(&args.config_dir, hw)
            .with_context(|| format!("loading database from {}", args.config_dir.display()))?,
    );

    let listener = TcpListener::bind(("0.0.0.0", args.port)).with_context(|| format!("binding port {}", args.port))?;
    info!("listening on port {}", args.port);
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                error!("accept error: {e}");
                continue;
            }
        };
        let runtime = runtime.clone();
        thread::spawn(move || handle_connection(runtime, stream));
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env().init();
    let args: Args = argh::from_env();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
