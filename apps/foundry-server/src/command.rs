//! Parsing of normalized commands into external invocations or built-ins.

pub(crate) const DEFAULT_LIST_DEPTH: usize = 3;
pub(crate) const MAX_LIST_DEPTH: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum DispatchError {
    #[error("unknown subcommand: {0}")]
    UnknownSubcommand(String),
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid slug: {0}")]
    InvalidSlug(String),
    #[error("invalid argument {name}: {value}")]
    InvalidArgument { name: &'static str, value: String },
    #[error("path escapes the application root: {0}")]
    PathOutsideRoot(String),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::UnknownSubcommand(_) => "unknown_subcommand",
            DispatchError::MissingArgument(_) => "missing_argument",
            DispatchError::InvalidSlug(_) => "invalid_slug",
            DispatchError::InvalidArgument { .. } => "invalid_argument",
            DispatchError::PathOutsideRoot(_) => "path_outside_root",
            DispatchError::NotConfigured(_) => "not_configured",
        }
    }
}

/// A validated command split into its program word, subcommand and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandEnvelope {
    pub raw: String,
    pub subcommand: String,
    pub args: Vec<String>,
    builtin: bool,
}

impl CommandEnvelope {
    pub fn parse(normalized: &str) -> Self {
        let mut words = split_args(normalized).into_iter();
        let program = words.next().unwrap_or_default();
        let subcommand = words.next().unwrap_or_default();
        Self {
            raw: normalized.to_string(),
            subcommand,
            args: words.collect(),
            builtin: program == "foundry",
        }
    }

    pub fn invocation(&self) -> Result<Invocation, DispatchError> {
        if !self.builtin {
            let mut argv = Vec::with_capacity(self.args.len() + 1);
            argv.push(self.subcommand.clone());
            argv.extend(self.args.iter().cloned());
            return Ok(Invocation::External { argv });
        }
        Builtin::parse(&self.subcommand, &self.args).map(Invocation::Builtin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Invocation {
    /// Arguments handed to the external tool, without the program name.
    External { argv: Vec<String> },
    Builtin(Builtin),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileListing {
    pub path: String,
    pub depth: usize,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Builtin {
    Version,
    CoreVersion,
    SelfVersion,
    SelfUpdateCheck { url: Option<String> },
    SelfUpdateApply { url: Option<String> },
    Files(FileListing),
    BackupPlugin { slug: String },
    BackupTheme { slug: String },
    BackupDb,
    BackupContent { exclude: Vec<String> },
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Version => "version",
            Builtin::CoreVersion => "core-version",
            Builtin::SelfVersion => "self-version",
            Builtin::SelfUpdateCheck { .. } => "self-update-check",
            Builtin::SelfUpdateApply { .. } => "self-update-apply",
            Builtin::Files(_) => "files",
            Builtin::BackupPlugin { .. } => "backup-plugin",
            Builtin::BackupTheme { .. } => "backup-theme",
            Builtin::BackupDb => "backup-db",
            Builtin::BackupContent { .. } => "backup-content",
        }
    }

    fn parse(sub: &str, args: &[String]) -> Result<Self, DispatchError> {
        let (flags, positional) = partition(args);
        Ok(match sub {
            "version" => Builtin::Version,
            "core-version" => Builtin::CoreVersion,
            "self-version" => Builtin::SelfVersion,
            "self-update-check" => Builtin::SelfUpdateCheck {
                url: positional.first().cloned(),
            },
            "self-update-apply" => Builtin::SelfUpdateApply {
                url: positional.first().cloned(),
            },
            "files" => {
                let depth = match flag(&flags, "depth") {
                    Some(raw) => raw
                        .parse::<usize>()
                        .ok()
                        .filter(|d| *d >= 1)
                        .map(|d| d.min(MAX_LIST_DEPTH))
                        .ok_or_else(|| DispatchError::InvalidArgument {
                            name: "depth",
                            value: raw.to_string(),
                        })?,
                    None => DEFAULT_LIST_DEPTH,
                };
                Builtin::Files(FileListing {
                    path: positional.first().cloned().unwrap_or_else(|| ".".into()),
                    depth,
                    include: list_flag(&flags, "include"),
                    exclude: list_flag(&flags, "exclude"),
                })
            }
            "backup-plugin" => Builtin::BackupPlugin {
                slug: slug_arg(&positional)?,
            },
            "backup-theme" => Builtin::BackupTheme {
                slug: slug_arg(&positional)?,
            },
            "backup-db" => Builtin::BackupDb,
            "backup-content" => Builtin::BackupContent {
                exclude: list_flag(&flags, "exclude"),
            },
            "" => return Err(DispatchError::MissingArgument("subcommand")),
            other => return Err(DispatchError::UnknownSubcommand(other.to_string())),
        })
    }
}

fn partition(args: &[String]) -> (Vec<(String, String)>, Vec<String>) {
    let mut flags = Vec::new();
    let mut positional = Vec::new();
    for arg in args {
        match arg.strip_prefix("--") {
            Some(rest) => {
                let (k, v) = rest.split_once('=').unwrap_or((rest, ""));
                flags.push((k.to_string(), v.to_string()));
            }
            None => positional.push(arg.clone()),
        }
    }
    (flags, positional)
}

fn flag<'a>(flags: &'a [(String, String)], name: &str) -> Option<&'a str> {
    flags
        .iter()
        .rev()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn list_flag(flags: &[(String, String)], name: &str) -> Vec<String> {
    flags
        .iter()
        .filter(|(k, _)| k == name)
        .flat_map(|(_, v)| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn slug_arg(positional: &[String]) -> Result<String, DispatchError> {
    let slug = positional
        .first()
        .ok_or(DispatchError::MissingArgument("slug"))?;
    if is_slug(slug) {
        Ok(slug.clone())
    } else {
        Err(DispatchError::InvalidSlug(slug.clone()))
    }
}

pub(crate) fn is_slug(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 200
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}

/// Whitespace split honouring single and double quotes; quotes are removed.
pub(crate) fn split_args(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;
    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => cur.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            None => {
                cur.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        out.push(cur);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin(cmd: &str) -> Result<Builtin, DispatchError> {
        match CommandEnvelope::parse(cmd).invocation()? {
            Invocation::Builtin(b) => Ok(b),
            other => panic!("expected builtin, got {other:?}"),
        }
    }

    #[test]
    fn splits_quoted_arguments() {
        assert_eq!(
            split_args(r#"wp option update blogname "My Site"  'a b' c"#),
            vec!["wp", "option", "update", "blogname", "My Site", "a b", "c"]
        );
        assert_eq!(split_args(r#"wp post create --post_title="""#), vec!["wp", "post", "create", "--post_title="]);
        assert_eq!(split_args("  "), Vec::<String>::new());
    }

    #[test]
    fn external_commands_drop_program_name() {
        let env = CommandEnvelope::parse("wp plugin list --format=json");
        assert_eq!(env.subcommand, "plugin");
        assert_eq!(
            env.invocation().unwrap(),
            Invocation::External {
                argv: vec!["plugin".into(), "list".into(), "--format=json".into()]
            }
        );
    }

    #[test]
    fn files_flags_are_parsed() {
        let b = builtin("foundry files wp-content --depth=2 --include=*.php,*.js --exclude=cache").unwrap();
        assert_eq!(
            b,
            Builtin::Files(FileListing {
                path: "wp-content".into(),
                depth: 2,
                include: vec!["*.php".into(), "*.js".into()],
                exclude: vec!["cache".into()],
            })
        );
        let Builtin::Files(listing) = builtin("foundry files").unwrap() else {
            panic!("files");
        };
        assert_eq!(listing.path, ".");
        assert_eq!(listing.depth, DEFAULT_LIST_DEPTH);
        let Builtin::Files(listing) = builtin("foundry files . --depth=99").unwrap() else {
            panic!("files");
        };
        assert_eq!(listing.depth, MAX_LIST_DEPTH);
        assert_eq!(builtin("foundry files . --depth=0").unwrap_err().code(), "invalid_argument");
    }

    #[test]
    fn backup_slugs_are_checked() {
        assert_eq!(
            builtin("foundry backup-plugin akismet").unwrap(),
            Builtin::BackupPlugin { slug: "akismet".into() }
        );
        assert_eq!(
            builtin("foundry backup-theme ../etc"),
            Err(DispatchError::InvalidSlug("../etc".into()))
        );
        assert_eq!(
            builtin("foundry backup-plugin"),
            Err(DispatchError::MissingArgument("slug"))
        );
    }

    #[test]
    fn unknown_builtin_is_reported() {
        assert_eq!(
            builtin("foundry reboot"),
            Err(DispatchError::UnknownSubcommand("reboot".into()))
        );
        assert_eq!(builtin("foundry "), Err(DispatchError::MissingArgument("subcommand")));
    }

    #[test]
    fn update_url_is_optional() {
        assert_eq!(
            builtin("foundry self-update-check").unwrap(),
            Builtin::SelfUpdateCheck { url: None }
        );
        assert_eq!(
            builtin("foundry self-update-apply https://example.test/agent.zip").unwrap(),
            Builtin::SelfUpdateApply {
                url: Some("https://example.test/agent.zip".into())
            }
        );
    }
}
