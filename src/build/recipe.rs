//! Build recipe (Dockerfile) parsing

use crate::error::{BerthError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Default recipe file name
pub const DEFAULT_RECIPE_FILE: &str = "Dockerfile";

/// Parsed build instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    /// FROM instruction - base image
    From {
        image: String,
        tag: Option<String>,
        alias: Option<String>,
    },
    /// RUN instruction - execute command
    Run { command: String, shell: bool },
    /// COPY instruction - copy files
    Copy {
        src: Vec<String>,
        dest: String,
        from: Option<String>,
        chown: Option<String>,
    },
    /// ADD instruction - add files
    Add {
        src: Vec<String>,
        dest: String,
        chown: Option<String>,
    },
    /// CMD instruction - default command
    Cmd { command: Vec<String>, shell: bool },
    /// ENTRYPOINT instruction
    Entrypoint { command: Vec<String>, shell: bool },
    /// ENV instruction - set environment variable
    Env { key: String, value: String },
    /// ARG instruction - build argument
    Arg {
        name: String,
        default: Option<String>,
    },
    /// WORKDIR instruction - set working directory
    Workdir { path: String },
    /// USER instruction - set user
    User { user: String, group: Option<String> },
    /// EXPOSE instruction - one or more ports
    Expose { ports: Vec<ExposedPort> },
    /// LABEL instruction - add metadata
    Label { labels: HashMap<String, String> },
    /// HEALTHCHECK instruction, `cmd` is `None` for `HEALTHCHECK NONE`
    Healthcheck {
        cmd: Option<String>,
        interval: Option<String>,
        retries: Option<u32>,
    },
    /// VOLUME instruction - mount points
    Volume { paths: Vec<String> },
    /// SHELL instruction - shell used by shell-form commands
    Shell { command: Vec<String> },
    /// STOPSIGNAL instruction
    StopSignal { signal: String },
    /// ONBUILD instruction, kept as written
    OnBuild { instruction: String },
}

/// Port declared by EXPOSE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: String,
}

/// Build stage (for multi-stage builds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStage {
    /// Stage name/alias
    pub name: Option<String>,
    /// Base image
    pub base_image: String,
    /// Base image tag
    pub base_tag: Option<String>,
    /// Instructions in this stage
    pub instructions: Vec<Instruction>,
}

/// Parsed recipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecipe {
    /// Build stages
    pub stages: Vec<BuildStage>,
}

/// Default process launched by the image: `<server> <module>:<app> --host H --port P`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    /// Server executable, e.g. `uvicorn`
    pub server: String,
    /// Module holding the application object
    pub module: String,
    /// Application object name
    pub app: String,
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl LaunchCommand {
    /// Parse from exec-form arguments
    pub fn parse(args: &[String]) -> Result<Self> {
        let (server, rest) = args
            .split_first()
            .ok_or_else(|| BerthError::Build("empty launch command".to_string()))?;

        let mut target = None;
        let mut host = None;
        let mut port = None;

        let mut iter = rest.iter();
        while let Some(arg) = iter.next() {
            if let Some(v) = arg.strip_prefix("--host=") {
                host = Some(v.to_string());
            } else if let Some(v) = arg.strip_prefix("--port=") {
                port = Some(v.to_string());
            } else if arg == "--host" {
                host = iter.next().cloned();
            } else if arg == "--port" {
                port = iter.next().cloned();
            } else if !arg.starts_with('-') && target.is_none() {
                target = Some(arg.clone());
            }
        }

        let target = target.ok_or_else(|| {
            BerthError::Build(format!("launch command has no <module>:<app>: {:?}", args))
        })?;
        let (module, app) = target.split_once(':').ok_or_else(|| {
            BerthError::Build(format!("launch target '{}' is not <module>:<app>", target))
        })?;
        let port = port
            .ok_or_else(|| BerthError::Build("launch command has no --port".to_string()))?;
        let port = port
            .parse()
            .map_err(|_| BerthError::Build(format!("invalid launch port '{}'", port)))?;

        Ok(Self {
            server: server.clone(),
            module: module.to_string(),
            app: app.to_string(),
            host: host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
        })
    }

    /// Whether the server listens on every interface
    pub fn binds_all_interfaces(&self) -> bool {
        self.host == "0.0.0.0" || self.host == "::"
    }

    /// Exec-form arguments
    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.server.clone(),
            format!("{}:{}", self.module, self.app),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ]
    }
}

impl BuildRecipe {
    /// Parse a recipe file
    pub fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse recipe content
    pub fn parse(content: &str) -> Result<Self> {
        let mut stages = Vec::new();
        let mut current_stage: Option<BuildStage> = None;
        let mut continued_line = String::new();
        let mut start_line = 0;

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if continued_line.is_empty() {
                start_line = line_num + 1;
            }

            // Handle line continuation
            if let Some(without_backslash) = line.strip_suffix('\\') {
                continued_line.push_str(without_backslash.trim_end());
                continued_line.push(' ');
                continue;
            }

            let full_line = if !continued_line.is_empty() {
                let result = format!("{}{}", continued_line, line);
                continued_line.clear();
                result
            } else {
                line.to_string()
            };

            let instruction = Self::parse_instruction(&full_line, start_line)?;

            match instruction {
                Instruction::From { image, tag, alias } => {
                    if let Some(stage) = current_stage.take() {
                        stages.push(stage);
                    }
                    current_stage = Some(BuildStage {
                        name: alias,
                        base_image: image,
                        base_tag: tag,
                        instructions: Vec::new(),
                    });
                }
                _ => match current_stage {
                    Some(ref mut stage) => stage.instructions.push(instruction),
                    None => {
                        return Err(BerthError::DockerfileParse {
                            line: start_line,
                            message: "Instruction before FROM".to_string(),
                        })
                    }
                },
            }
        }

        if !continued_line.is_empty() {
            return Err(BerthError::DockerfileParse {
                line: start_line,
                message: "Line continuation at end of file".to_string(),
            });
        }

        if let Some(stage) = current_stage {
            stages.push(stage);
        }

        if stages.is_empty() {
            return Err(BerthError::DockerfileParse {
                line: 0,
                message: "No FROM instruction found".to_string(),
            });
        }

        Ok(Self { stages })
    }

    /// Stage that produces the final image; `None` only for a recipe
    /// assembled without [`BuildRecipe::parse`]
    pub fn final_stage(&self) -> Option<&BuildStage> {
        self.stages.last()
    }

    fn final_instructions(&self) -> &[Instruction] {
        self.final_stage()
            .map(|s| s.instructions.as_slice())
            .unwrap_or_default()
    }

    /// Base image of the final stage as `image[:tag]`
    pub fn base_image(&self) -> Option<String> {
        let stage = self.final_stage()?;
        Some(match &stage.base_tag {
            Some(tag) => format!("{}:{}", stage.base_image, tag),
            None => stage.base_image.clone(),
        })
    }

    /// Working directory in effect at the end of the final stage
    pub fn working_dir(&self) -> Option<&str> {
        self.final_instructions()
            .iter()
            .rev()
            .find_map(|i| match i {
                Instruction::Workdir { path } => Some(path.as_str()),
                _ => None,
            })
    }

    /// Ports declared with EXPOSE in the final stage
    pub fn exposed_ports(&self) -> Vec<u16> {
        self.final_instructions()
            .iter()
            .flat_map(|i| match i {
                Instruction::Expose { ports } => ports.iter().map(|p| p.port).collect(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// RUN commands of the final stage, in order
    pub fn run_steps(&self) -> Vec<&str> {
        self.final_instructions()
            .iter()
            .filter_map(|i| match i {
                Instruction::Run { command, .. } => Some(command.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Sources copied from the build context (not from other stages)
    pub fn context_sources(&self) -> Vec<&str> {
        self.stages
            .iter()
            .flat_map(|s| s.instructions.iter())
            .flat_map(|i| match i {
                Instruction::Copy { src, from: None, .. } | Instruction::Add { src, .. } => {
                    src.iter().map(String::as_str).collect::<Vec<_>>()
                }
                _ => Vec::new(),
            })
            .collect()
    }

    /// Default container process: last ENTRYPOINT followed by last CMD
    pub fn default_command(&self) -> Vec<String> {
        let mut entrypoint = Vec::new();
        let mut cmd = Vec::new();
        for instruction in self.final_instructions() {
            match instruction {
                Instruction::Entrypoint { command, shell } => entrypoint = shell_wrap(command, *shell),
                Instruction::Cmd { command, shell } => cmd = shell_wrap(command, *shell),
                _ => {}
            }
        }
        entrypoint.extend(cmd);
        entrypoint
    }

    /// Default command interpreted as an HTTP server launch
    pub fn launch_command(&self) -> Result<LaunchCommand> {
        LaunchCommand::parse(&self.default_command())
    }

    /// Parse a single instruction
    fn parse_instruction(line: &str, line_num: usize) -> Result<Instruction> {
        let (keyword, args) = match line.split_once(char::is_whitespace) {
            Some((k, a)) => (k, a.trim()),
            None => (line, ""),
        };

        match keyword.to_uppercase().as_str() {
            "FROM" => Self::parse_from(args, line_num),
            "RUN" => Ok(Instruction::Run {
                command: args.to_string(),
                shell: !args.starts_with('['),
            }),
            "COPY" => Self::parse_copy(args, line_num),
            "ADD" => Self::parse_add(args, line_num),
            "CMD" => {
                let (command, shell) = Self::parse_command(args, line_num)?;
                Ok(Instruction::Cmd { command, shell })
            }
            "ENTRYPOINT" => {
                let (command, shell) = Self::parse_command(args, line_num)?;
                Ok(Instruction::Entrypoint { command, shell })
            }
            "ENV" => Self::parse_env(args, line_num),
            "ARG" => Ok(match args.split_once('=') {
                Some((name, default)) => Instruction::Arg {
                    name: name.trim().to_string(),
                    default: Some(default.trim().to_string()),
                },
                None => Instruction::Arg {
                    name: args.to_string(),
                    default: None,
                },
            }),
            "WORKDIR" => Ok(Instruction::Workdir {
                path: args.to_string(),
            }),
            "USER" => Ok(match args.split_once(':') {
                Some((user, group)) => Instruction::User {
                    user: user.to_string(),
                    group: Some(group.to_string()),
                },
                None => Instruction::User {
                    user: args.to_string(),
                    group: None,
                },
            }),
            "EXPOSE" => Self::parse_expose(args, line_num),
            "LABEL" => Ok(Self::parse_label(args)),
            "HEALTHCHECK" => Ok(Self::parse_healthcheck(args)),
            "VOLUME" => Ok(Instruction::Volume {
                paths: Self::parse_list(args, line_num)?,
            }),
            "SHELL" => {
                let (command, shell) = Self::parse_command(args, line_num)?;
                if shell {
                    return Err(BerthError::DockerfileParse {
                        line: line_num,
                        message: "SHELL requires the exec form".to_string(),
                    });
                }
                Ok(Instruction::Shell { command })
            }
            "STOPSIGNAL" => Ok(Instruction::StopSignal {
                signal: args.to_string(),
            }),
            "ONBUILD" => Ok(Instruction::OnBuild {
                instruction: args.to_string(),
            }),
            other => Err(BerthError::DockerfileParse {
                line: line_num,
                message: format!("Unknown instruction: {}", other),
            }),
        }
    }

    fn parse_from(args: &str, line_num: usize) -> Result<Instruction> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let Some(reference) = parts.first() else {
            return Err(BerthError::DockerfileParse {
                line: line_num,
                message: "FROM requires an image".to_string(),
            });
        };

        let (image, tag) = match reference.rsplit_once(':') {
            // A colon inside a registry host:port is not a tag separator
            Some((image, tag)) if !tag.contains('/') => (image.to_string(), Some(tag.to_string())),
            _ => (reference.to_string(), None),
        };

        let alias = match parts.as_slice() {
            [_, kw, name, ..] if kw.eq_ignore_ascii_case("AS") => Some(name.to_string()),
            _ => None,
        };

        Ok(Instruction::From { image, tag, alias })
    }

    /// Leading `--flag=value` options, then the remaining words
    fn split_flags(args: &str) -> (HashMap<String, String>, Vec<String>) {
        let mut flags = HashMap::new();
        let mut words = Vec::new();
        for word in args.split_whitespace() {
            match word.strip_prefix("--").and_then(|f| f.split_once('=')) {
                Some((k, v)) if words.is_empty() => {
                    flags.insert(k.to_string(), v.to_string());
                }
                _ => words.push(word.to_string()),
            }
        }
        (flags, words)
    }

    fn parse_copy(args: &str, line_num: usize) -> Result<Instruction> {
        let (mut flags, mut words) = Self::split_flags(args);
        let dest = Self::take_dest(&mut words, "COPY", line_num)?;
        Ok(Instruction::Copy {
            src: words,
            dest,
            from: flags.remove("from"),
            chown: flags.remove("chown"),
        })
    }

    fn parse_add(args: &str, line_num: usize) -> Result<Instruction> {
        let (mut flags, mut words) = Self::split_flags(args);
        let dest = Self::take_dest(&mut words, "ADD", line_num)?;
        Ok(Instruction::Add {
            src: words,
            dest,
            chown: flags.remove("chown"),
        })
    }

    fn take_dest(words: &mut Vec<String>, keyword: &str, line_num: usize) -> Result<String> {
        if words.len() < 2 {
            return Err(BerthError::DockerfileParse {
                line: line_num,
                message: format!("{} requires at least one source and a destination", keyword),
            });
        }
        words.pop().ok_or_else(|| BerthError::DockerfileParse {
            line: line_num,
            message: format!("{} requires a destination", keyword),
        })
    }

    /// Exec form (JSON array) or shell form
    fn parse_command(args: &str, line_num: usize) -> Result<(Vec<String>, bool)> {
        if args.starts_with('[') {
            let command: Vec<String> =
                serde_json::from_str(args).map_err(|e| BerthError::DockerfileParse {
                    line: line_num,
                    message: format!("Invalid exec form: {}", e),
                })?;
            Ok((command, false))
        } else {
            Ok((vec![args.to_string()], true))
        }
    }

    fn parse_env(args: &str, line_num: usize) -> Result<Instruction> {
        // Support both ENV key=value and ENV key value
        if let Some((key, value)) = args.split_once('=') {
            Ok(Instruction::Env {
                key: key.trim().to_string(),
                value: value.trim().trim_matches('"').to_string(),
            })
        } else {
            match args.split_once(char::is_whitespace) {
                Some((key, value)) => Ok(Instruction::Env {
                    key: key.to_string(),
                    value: value.trim().to_string(),
                }),
                None => Err(BerthError::DockerfileParse {
                    line: line_num,
                    message: "ENV requires a key and value".to_string(),
                }),
            }
        }
    }

    fn parse_expose(args: &str, line_num: usize) -> Result<Instruction> {
        let ports = args
            .split_whitespace()
            .map(|spec| {
                let (port, protocol) = spec.split_once('/').unwrap_or((spec, "tcp"));
                let port: u16 = port.parse().map_err(|_| BerthError::DockerfileParse {
                    line: line_num,
                    message: format!("Invalid port number: {}", port),
                })?;
                Ok(ExposedPort {
                    port,
                    protocol: protocol.to_ascii_lowercase(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if ports.is_empty() {
            return Err(BerthError::DockerfileParse {
                line: line_num,
                message: "EXPOSE requires a port".to_string(),
            });
        }
        Ok(Instruction::Expose { ports })
    }

    /// JSON array or whitespace separated words
    fn parse_list(args: &str, line_num: usize) -> Result<Vec<String>> {
        if args.starts_with('[') {
            serde_json::from_str(args).map_err(|e| BerthError::DockerfileParse {
                line: line_num,
                message: format!("Invalid JSON list: {}", e),
            })
        } else {
            Ok(args.split_whitespace().map(str::to_string).collect())
        }
    }

    fn parse_label(args: &str) -> Instruction {
        let labels = args
            .split_whitespace()
            .filter_map(|part| part.split_once('='))
            .map(|(k, v)| (k.to_string(), v.trim_matches('"').to_string()))
            .collect();
        Instruction::Label { labels }
    }

    fn parse_healthcheck(args: &str) -> Instruction {
        if args.trim().eq_ignore_ascii_case("NONE") {
            return Instruction::Healthcheck {
                cmd: None,
                interval: None,
                retries: None,
            };
        }

        let mut interval = None;
        let mut retries = None;
        let mut cmd = None;

        let parts: Vec<&str> = args.split_whitespace().collect();
        for (i, part) in parts.iter().enumerate() {
            if let Some(v) = part.strip_prefix("--interval=") {
                interval = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("--retries=") {
                retries = v.parse().ok();
            } else if *part == "CMD" {
                cmd = Some(parts[i + 1..].join(" "));
                break;
            }
        }

        Instruction::Healthcheck {
            cmd,
            interval,
            retries,
        }
    }
}

fn shell_wrap(command: &[String], shell: bool) -> Vec<String> {
    if shell {
        let mut args = vec!["/bin/sh".to_string(), "-c".to_string()];
        args.extend(command.iter().cloned());
        args
    } else {
        command.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_RECIPE: &str = r#"
FROM python:3.11-slim

WORKDIR /app

COPY requirements.txt .
RUN pip install --no-cache-dir \
    -r requirements.txt

COPY . .

EXPOSE 8000

CMD ["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "8000"]
"#;

    #[test]
    fn test_parse_app_recipe() {
        let recipe = BuildRecipe::parse(APP_RECIPE).unwrap();
        assert_eq!(recipe.stages.len(), 1);
        assert_eq!(recipe.base_image().as_deref(), Some("python:3.11-slim"));
        assert_eq!(recipe.working_dir(), Some("/app"));
        assert_eq!(recipe.exposed_ports(), vec![8000]);
        assert_eq!(
            recipe.run_steps(),
            vec!["pip install --no-cache-dir -r requirements.txt"]
        );
        assert_eq!(recipe.context_sources(), vec!["requirements.txt", "."]);
    }

    #[test]
    fn test_launch_command() {
        let recipe = BuildRecipe::parse(APP_RECIPE).unwrap();
        let launch = recipe.launch_command().unwrap();
        assert_eq!(launch.server, "uvicorn");
        assert_eq!(launch.module, "main");
        assert_eq!(launch.app, "app");
        assert_eq!(launch.port, 8000);
        assert!(launch.binds_all_interfaces());
        assert_eq!(LaunchCommand::parse(&launch.to_args()).unwrap(), launch);
    }

    #[test]
    fn test_launch_command_defaults_to_loopback() {
        let args: Vec<String> = ["uvicorn", "main:app", "--port=9000"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let launch = LaunchCommand::parse(&args).unwrap();
        assert!(!launch.binds_all_interfaces());
        assert_eq!(launch.port, 9000);

        let no_port: Vec<String> = vec!["uvicorn".into(), "main:app".into()];
        assert!(LaunchCommand::parse(&no_port).is_err());
    }

    #[test]
    fn test_parse_multistage_build() {
        let content = r#"
FROM rust:1.70 AS builder
WORKDIR /app
COPY . .
RUN cargo build --release

FROM registry.local:5000/debian
COPY --from=builder /app/target/release/myapp /usr/local/bin/
ENTRYPOINT ["myapp"]
CMD ["--help"]
"#;

        let recipe = BuildRecipe::parse(content).unwrap();
        assert_eq!(recipe.stages.len(), 2);
        assert_eq!(recipe.stages[0].name, Some("builder".to_string()));
        let last = recipe.final_stage().unwrap();
        assert_eq!(last.base_image, "registry.local:5000/debian");
        assert_eq!(last.base_tag, None);
        assert_eq!(recipe.context_sources(), vec!["."]);
        assert_eq!(recipe.default_command(), vec!["myapp", "--help"]);
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let err = BuildRecipe::parse("RUN echo hi").unwrap_err();
        assert!(matches!(err, BerthError::DockerfileParse { line: 1, .. }));

        let err = BuildRecipe::parse("FROM x\n\nEXPOSE http").unwrap_err();
        assert!(matches!(err, BerthError::DockerfileParse { line: 3, .. }));

        let err = BuildRecipe::parse("FROM x\nFROBNICATE now").unwrap_err();
        assert!(matches!(err, BerthError::DockerfileParse { line: 2, .. }));

        assert!(BuildRecipe::parse("# only comments").is_err());
        assert!(BuildRecipe::parse("FROM x\nCOPY onlyone").is_err());
    }

    #[test]
    fn test_shell_form_cmd() {
        let recipe = BuildRecipe::parse("FROM x\nCMD uvicorn main:app --port 8000").unwrap();
        assert_eq!(
            recipe.default_command(),
            vec!["/bin/sh", "-c", "uvicorn main:app --port 8000"]
        );
    }

    #[test]
    fn test_remaining_instructions_accepted() {
        let content = r#"
FROM postgres:16
SHELL ["/bin/bash", "-c"]
VOLUME ["/var/lib/postgresql/data"]
VOLUME /tmp /run
STOPSIGNAL SIGINT
ONBUILD COPY . /src
EXPOSE 5432
"#;
        let recipe = BuildRecipe::parse(content).unwrap();
        let instructions = &recipe.final_stage().unwrap().instructions;
        assert_eq!(
            instructions[0],
            Instruction::Shell {
                command: vec!["/bin/bash".to_string(), "-c".to_string()]
            }
        );
        assert_eq!(
            instructions[2],
            Instruction::Volume {
                paths: vec!["/tmp".to_string(), "/run".to_string()]
            }
        );
        assert_eq!(
            instructions[3],
            Instruction::StopSignal {
                signal: "SIGINT".to_string()
            }
        );
        assert_eq!(recipe.exposed_ports(), vec![5432]);
        // ONBUILD sources belong to downstream builds
        assert!(recipe.context_sources().is_empty());

        assert!(BuildRecipe::parse("FROM x\nSHELL /bin/bash").is_err());
    }

    #[test]
    fn test_expose_several_ports() {
        let recipe = BuildRecipe::parse("FROM x\nEXPOSE 8000 9000/udp\nEXPOSE 9100").unwrap();
        assert_eq!(recipe.exposed_ports(), vec![8000, 9000, 9100]);
        assert_eq!(
            recipe.final_stage().unwrap().instructions[0],
            Instruction::Expose {
                ports: vec![
                    ExposedPort {
                        port: 8000,
                        protocol: "tcp".to_string()
                    },
                    ExposedPort {
                        port: 9000,
                        protocol: "udp".to_string()
                    },
                ]
            }
        );
        assert!(BuildRecipe::parse("FROM x\nEXPOSE 8000 http").is_err());
    }

    #[test]
    fn test_empty_recipe_has_no_final_stage() {
        let recipe = BuildRecipe { stages: Vec::new() };
        assert!(recipe.final_stage().is_none());
        assert!(recipe.base_image().is_none());
        assert!(recipe.exposed_ports().is_empty());
        assert!(recipe.default_command().is_empty());
        assert!(recipe.launch_command().is_err());
    }
}
