use cfg_aliases::cfg_aliases;

fn main() {
    cfg_aliases! {
        has_accept4: { any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "illumos",
            target_os = "linux",
            target_os = "netbsd",
            target_os = "openbsd"
        ) },
        msg_nosignal: { any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "linux",
            target_os = "netbsd",
            target_os = "openbsd"
        ) },
        apple: { any(
            target_os = "ios",
            target_os = "macos",
            target_os = "tvos",
            target_os = "watchos"
        ) },
        pidfd: { target_os = "linux" },
        kqueue_proc: { any(
            apple,
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ) }
    }
}
