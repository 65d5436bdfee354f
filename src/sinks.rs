//! Action sinks: where a fired rule's message goes (spec §6).
//!
//! The source runs a rule's exec action through `system(message)` (see
//! `SensorsData.cpp`). Shelling out to `/bin/sh -c` would let a sensor name
//! containing shell metacharacters inject commands, so this splits the
//! rendered message into an argv the same way a shell would and executes it
//! directly with [`std::process::Command`] instead.

use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

use crate::config::SinkConfig;

#[derive(Debug, Error)]
pub enum Error {
    #[error("mqtt publish failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to spawn action command: {0}")]
    Spawn(std::io::Error),
    #[error("action command line was empty")]
    EmptyCommand,
}

/// Where a rule's rendered message (and, for MQTT, a topic) is delivered.
/// Errors are logged by the caller and never propagate into rule
/// evaluation (spec §7.5: "publisher errors... do not retry from the
/// core").
pub trait ActionSink: Send + Sync {
    fn dispatch(&self, topic: Option<&str>, message: &str) -> Result<(), Error>;
}

/// Prints the message to stdout, prefixed with the topic if one is given.
/// Always available, even with an empty `sinks` configuration (spec §6's
/// default sink).
pub struct StdoutSink;

impl ActionSink for StdoutSink {
    fn dispatch(&self, topic: Option<&str>, message: &str) -> Result<(), Error> {
        match topic {
            Some(topic) => println!("{topic}: {message}"),
            None => println!("{message}"),
        }
        Ok(())
    }
}

/// Publishes to a broker over a blocking `rumqttc` client. The client's
/// event loop runs on a background thread for the sink's lifetime so
/// `publish` calls don't need to pump it themselves.
pub struct MqttSink {
    client: rumqttc::Client,
    _connection_thread: std::thread::JoinHandle<()>,
}

impl MqttSink {
    #[must_use]
    pub fn new(host: &str, port: u16, client_id: &str) -> MqttSink {
        let mut options = rumqttc::MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut connection) = rumqttc::Client::new(options, 64);
        let connection_thread = std::thread::spawn(move || {
            for notification in connection.iter() {
                if notification.is_err() {
                    break;
                }
            }
        });
        MqttSink { client, _connection_thread: connection_thread }
    }
}

impl ActionSink for MqttSink {
    fn dispatch(&self, topic: Option<&str>, message: &str) -> Result<(), Error> {
        let topic = topic.unwrap_or("rf-gateway/rule");
        self.client.publish(topic, rumqttc::QoS::AtLeastOnce, false, message)?;
        Ok(())
    }
}

/// Posts the message body (or, for an InfluxDB-shaped sink, the line
/// already built by the caller) to an HTTP endpoint.
pub struct RestSink {
    client: reqwest::blocking::Client,
    url: String,
}

impl RestSink {
    #[must_use]
    pub fn new(url: &str) -> RestSink {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        RestSink { client, url: url.to_string() }
    }
}

impl ActionSink for RestSink {
    fn dispatch(&self, _topic: Option<&str>, message: &str) -> Result<(), Error> {
        self.client.post(&self.url).body(message.to_string()).send()?.error_for_status()?;
        Ok(())
    }
}

/// Runs the rendered message as a subprocess command line.
pub struct ExecSink;

impl ActionSink for ExecSink {
    fn dispatch(&self, _topic: Option<&str>, message: &str) -> Result<(), Error> {
        let argv = exec::split_argv(message);
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::EmptyCommand);
        };
        Command::new(program).args(args).spawn().map_err(Error::Spawn)?;
        Ok(())
    }
}

/// Builds the concrete sink a [`SinkConfig`] describes.
#[must_use]
pub fn build_sink(config: &SinkConfig) -> Box<dyn ActionSink> {
    match config {
        SinkConfig::Stdout => Box::new(StdoutSink),
        SinkConfig::Mqtt { host, port, client_id, .. } => {
            let client_id = client_id.clone().unwrap_or_else(|| "rf-gateway".to_string());
            Box::new(MqttSink::new(host, *port, &client_id))
        }
        SinkConfig::Rest { url, .. } => Box::new(RestSink::new(url)),
        SinkConfig::Exec { .. } => Box::new(ExecSink),
    }
}

/// Multiple sinks addressed by id, as configured; `"stdout"` always resolves
/// even when not explicitly declared.
pub struct SinkTable {
    sinks: Vec<(String, Box<dyn ActionSink>)>,
}

impl SinkTable {
    #[must_use]
    pub fn new(configs: &[SinkConfig]) -> SinkTable {
        let mut sinks: Vec<(String, Box<dyn ActionSink>)> =
            configs.iter().map(|c| (c.id().to_string(), build_sink(c))).collect();
        if !sinks.iter().any(|(id, _)| id == "stdout") {
            sinks.push(("stdout".to_string(), Box::new(StdoutSink)));
        }
        SinkTable { sinks }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&dyn ActionSink> {
        self.sinks.iter().find(|(sink_id, _)| sink_id == id).map(|(_, sink)| sink.as_ref())
    }
}

/// Guards the `exec` sink's one item of shared mutable state: none today,
/// but `Mutex` keeps the type `Sync` if a future revision adds a rate limit
/// without auditing every call site again.
#[allow(dead_code)]
struct ExecGuard(Mutex<()>);

pub mod exec {
    //! Quoted command-line splitting for the exec sink, grounded on the
    //! source's shell-quoting grammar: single quotes, double quotes (with
    //! `\"` and `\\` recognized inside), and `\xHH` byte escapes outside
    //! quotes.

    /// Split `text` into argv the way a POSIX shell would for a simple
    /// (pipeline-free, variable-free) command line.
    #[must_use]
    pub fn split_argv(text: &str) -> Vec<String> {
        let mut args = Vec::new();
        let mut current = String::new();
        let mut in_arg = false;
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                ' ' | '\t' if !in_arg || current.is_empty() => {
                    if in_arg && !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                        in_arg = false;
                    }
                }
                ' ' | '\t' => {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
                '\'' => {
                    in_arg = true;
                    for c in chars.by_ref() {
                        if c == '\'' {
                            break;
                        }
                        current.push(c);
                    }
                }
                '"' => {
                    in_arg = true;
                    while let Some(c) = chars.next() {
                        match c {
                            '"' => break,
                            '\\' if matches!(chars.peek(), Some('"') | Some('\\')) => {
                                current.push(chars.next().unwrap());
                            }
                            other => current.push(other),
                        }
                    }
                }
                '\\' if chars.peek() == Some(&'x') => {
                    in_arg = true;
                    chars.next();
                    let hi = chars.next();
                    let lo = chars.next();
                    if let (Some(hi), Some(lo)) = (hi, lo) {
                        if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                            current.push(byte as char);
                            continue;
                        }
                    }
                    current.push('\\');
                    current.push('x');
                }
                other => {
                    in_arg = true;
                    current.push(other);
                }
            }
        }
        if in_arg || !current.is_empty() {
            args.push(current);
        }
        args
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn splits_on_plain_whitespace() {
            assert_eq!(split_argv("notify-send Porch hot"), vec!["notify-send", "Porch", "hot"]);
        }

        #[test]
        fn single_quotes_preserve_spaces() {
            assert_eq!(split_argv("echo 'hello world'"), vec!["echo", "hello world"]);
        }

        #[test]
        fn double_quotes_allow_escaped_quote() {
            assert_eq!(split_argv(r#"echo "say \"hi\"""#), vec!["echo", "say \"hi\""]);
        }

        #[test]
        fn hex_escape_decodes_a_byte() {
            assert_eq!(split_argv(r"echo hot\x21"), vec!["echo", "hot!"]);
        }

        #[test]
        fn collapses_repeated_whitespace() {
            assert_eq!(split_argv("a   b\tc"), vec!["a", "b", "c"]);
        }

        #[test]
        fn empty_text_yields_no_args() {
            assert!(split_argv("").is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_sink_never_fails() {
        let sink = StdoutSink;
        assert!(sink.dispatch(Some("topic"), "message").is_ok());
        assert!(sink.dispatch(None, "message").is_ok());
    }

    #[test]
    fn exec_sink_rejects_empty_command() {
        let sink = ExecSink;
        assert!(matches!(sink.dispatch(None, "   "), Err(Error::EmptyCommand)));
    }

    #[test]
    fn exec_sink_runs_true() {
        let sink = ExecSink;
        assert!(sink.dispatch(None, "true").is_ok());
    }

    #[test]
    fn sink_table_always_resolves_stdout() {
        let table = SinkTable::new(&[]);
        assert!(table.get("stdout").is_some());
        assert!(table.get("missing").is_none());
    }
}
