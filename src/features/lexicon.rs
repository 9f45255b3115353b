//! Keyword tables used by the feature extractor and the rule classifier

/// Words that open a command. Also used as the verb list for POS tagging.
pub const IMPERATIVE_VERBS: &[&str] = &[
    "show", "display", "print", "list", "get", "fetch", "find", "search",
    "create", "make", "add", "write", "save", "store", "run", "execute",
    "start", "stop", "kill", "restart", "delete", "remove", "clear", "clean",
    "update", "modify", "change", "edit", "rename", "move", "install",
    "uninstall", "download", "upload", "open", "close", "launch", "exit",
    "help", "explain", "describe", "tell", "what", "how", "why", "append",
    "touch", "copy", "check", "count", "summarize", "analyze", "convert",
    "parse", "compute", "calculate", "evaluate",
];

/// Words that only read state and print it back
pub const IMMEDIATE_READ_VERBS: &[&str] = &[
    "show", "display", "print", "list", "get", "fetch", "find", "search",
    "check", "count", "view", "see", "cat", "read",
];

pub const URGENCY_WORDS: &[&str] = &[
    "now", "immediately", "quick", "fast", "asap", "hurry", "urgent", "quickly",
];

pub const CODE_KEYWORDS: &[&str] = &[
    "code", "function", "class", "method", "variable", "bug", "error", "test",
    "debug", "compile", "build", "deploy", "refactor", "import", "export",
    "module", "package", "library", "api", "script", "python", "javascript",
    "typescript", "rust", "java", "go",
];

pub const SYSTEM_KEYWORDS: &[&str] = &[
    "memory", "cpu", "disk", "process", "processes", "service", "port",
    "network", "file", "folder", "directory", "permission", "user", "group",
    "install", "package", "apt", "dnf", "pacman", "systemctl", "docker",
    "container", "pod", "kubernetes", "usage", "uptime", "load",
];

pub const GIT_KEYWORDS: &[&str] = &[
    "git", "commit", "push", "pull", "merge", "branch", "checkout", "rebase",
    "stash", "diff", "clone", "remote",
];

pub const TEST_KEYWORDS: &[&str] = &[
    "test", "tests", "pytest", "unittest", "coverage", "assert", "mock",
    "fixture", "tdd", "bdd",
];

pub const FILE_OPERATION_VERBS: &[&str] = &[
    "save", "write", "create", "delete", "remove", "move", "copy", "rename",
    "backup", "restore", "export", "import", "append", "touch",
];

/// Commands whose first-token presence marks the directive as literal shell
pub const SHELL_COMMANDS: &[&str] = &[
    "ls", "cd", "rm", "cp", "mv", "mkdir", "rmdir", "cat", "grep", "find",
    "chmod", "chown", "echo", "ps", "kill", "killall", "df", "du", "free",
    "top", "htop", "tar", "curl", "wget", "ssh", "scp", "sudo", "su", "apt",
    "apt-get", "dnf", "yum", "pacman", "systemctl", "service", "docker",
    "git", "make", "cargo", "npm", "pip", "python", "python3", "node", "sh",
    "bash", "dd", "mkfs", "mount", "umount", "touch", "head", "tail", "sed",
    "awk", "sort", "uniq", "wc", "whoami", "uname", "pwd", "env", "export",
    "ln", "fdisk", "parted", "shutdown", "reboot",
];

pub const INTERROGATIVE_PREFIXES: &[&str] = &[
    "what", "how", "why", "when", "where", "who", "which", "is ", "are ",
    "can ", "do ", "does ",
];

pub const CONDITIONAL_WORDS: &[&str] = &["if", "unless", "when", "while", "whether"];

pub const NEGATION_WORDS: &[&str] = &[
    "not", "don't", "doesn't", "won't", "can't", "never", "no",
];

/// Words that carry no referent on their own
pub const FILLER_WORDS: &[&str] = &[
    "it", "this", "that", "these", "those", "thing", "things", "stuff",
    "something", "somehow", "whatever", "them", "they", "just", "maybe",
    "like", "kinda", "sorta", "etc", "there", "here",
];

pub const NOUN_SUFFIXES: &[&str] = &["tion", "ment", "ness", "ity", "er", "or"];

pub const CODE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".tsx", ".jsx", ".rs", ".go", ".java", ".c", ".cpp", ".h", ".sh", ".rhai",
];
pub const DOC_EXTENSIONS: &[&str] = &[".md", ".txt", ".doc", ".docx", ".pdf", ".rst"];
pub const CONFIG_EXTENSIONS: &[&str] = &[".json", ".yaml", ".yml", ".toml", ".ini", ".conf", ".env"];
pub const DATA_EXTENSIONS: &[&str] = &[".csv", ".xml", ".sql", ".db", ".sqlite"];

/// Substring markers per programming language
pub const LANGUAGE_MARKERS: &[(&str, &[&str])] = &[
    ("python", &["python", "py ", ".py", "pytest", "pip"]),
    ("javascript", &["javascript", "js ", ".js", "node", "npm"]),
    ("typescript", &["typescript", "ts ", ".ts", ".tsx"]),
    ("rust", &["rust", ".rs", "cargo"]),
    ("go", &[" go ", "golang", ".go"]),
    ("java", &["java ", ".java", "maven", "gradle"]),
    ("shell", &["bash", "shell", ".sh", "zsh"]),
    ("rhai", &["rhai", ".rhai"]),
];

pub fn contains(table: &[&str], word: &str) -> bool {
    table.iter().any(|w| *w == word)
}

/// Verbs whose effect outlives the request
pub const MUTATING_VERBS: &[&str] = &[
    "create", "make", "add", "write", "save", "store", "run", "execute",
    "start", "stop", "kill", "restart", "delete", "remove", "clear", "clean",
    "update", "modify", "change", "edit", "rename", "move", "install",
    "uninstall", "download", "upload", "launch", "append", "touch", "copy",
    "build", "deploy",
];

pub const PROCESS_VERBS: &[&str] = &[
    "run", "execute", "start", "stop", "kill", "restart", "install",
    "uninstall", "launch", "build", "deploy",
];

pub const DESTRUCTIVE_WORDS: &[&str] = &[
    "delete", "remove", "kill", "stop", "clear", "wipe", "erase", "destroy",
    "drop", "purge", "truncate", "format", "rm", "rmdir", "dd", "mkfs",
    "shred", "killall",
];

pub const ANALYSIS_VERBS: &[&str] = &[
    "explain", "describe", "summarize", "analyze", "evaluate", "compute",
    "calculate", "convert", "parse", "interpret", "translate", "compare",
];

pub const EXPLANATION_WORDS: &[&str] = &["explain", "describe", "tell", "summarize", "why"];

pub const DISPLAY_WORDS: &[&str] = &[
    "show", "display", "print", "tell", "explain", "describe", "summarize", "list", "view",
];

pub const STATUS_WORDS: &[&str] = &["status", "usage", "uptime", "version", "load", "info", "stats"];

pub const STRUCTURED_FORMAT_WORDS: &[&str] = &["json", "csv", "xml", "yaml", "toml", "parse", "api"];

pub const SCRIPT_WORDS: &[&str] = &["script", "expression", "formula", "program", "snippet"];

pub const PERSONAL_WORDS: &[&str] = &["me", "my", "i", "mine"];

/// Shell commands that only read state
pub const READ_ONLY_COMMANDS: &[&str] = &[
    "ls", "cat", "grep", "find", "ps", "df", "du", "free", "top", "htop",
    "head", "tail", "wc", "whoami", "uname", "pwd", "env", "sort", "uniq",
    "echo",
];
