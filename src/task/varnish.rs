// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Varnish cache in front of production sites.
//!
//! Caching an app points its nginx site at varnish instead of gunicorn.
//! Varnish then forwards cache misses to the app's own port. Both tasks only
//! make sense in production.

use crate::{
    app::App,
    task::{deployment, remote::quote, Result, TaskContext},
};

use minijinja::context;
use tracing::{info, instrument};

/// Port varnish listens on.
pub const VARNISH_PORT: u16 = 6081;

const DEFAULT: &str = r#"START=yes
NFILES=131072
MEMLOCK=82000
DAEMON_OPTS="-a :6081 \
             -T localhost:6082 \
             -t 3600 \
             -f /etc/varnish/main.vcl \
             -S /etc/varnish/secret \
             -s file,/var/lib/varnish/$INSTANCE/varnish_storage.bin,10G"
"#;

const MAIN_VCL: &str = r#"sub vcl_recv {
    set req.http.Host = regsub(req.http.Host, "^www\.", "");
    set req.http.Host = regsub(req.http.Host, ":80$", "");
}

include "/etc/varnish/sites.vcl";
"#;

const SITES_VCL: &str = "/etc/varnish/sites.vcl";
const SITES_DIR: &str = "/etc/varnish/sites";

/// Put app behind varnish.
#[instrument(skip(ctx, app), fields(app = app.name()), level = "debug")]
pub fn cache(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    ctx.ensure_packages(&["varnish"])?;
    ctx.put("/etc/default/varnish", DEFAULT.as_bytes(), None)?;
    ctx.put("/etc/varnish/main.vcl", MAIN_VCL.as_bytes(), None)?;

    let site_config = format!("{SITES_DIR}/{}.vcl", app.name());
    let include = format!("include \"{site_config}\";");
    if ctx.exists(SITES_VCL)? {
        let (include, sites_vcl) = (quote(&include)?, quote(SITES_VCL)?);
        ctx.sudo(&format!(
            "grep -qxF {include} {sites_vcl} || echo {include} >> {sites_vcl}"
        ))?;
    } else {
        ctx.put(SITES_VCL, format!("{include}\n").as_bytes(), None)?;
    }

    ctx.ensure_directory(SITES_DIR, None)?;
    ctx.put(&site_config, site_vcl(app).as_bytes(), None)?;
    ctx.restart_service("varnish")?;

    let cached = app.replace([("port", VARNISH_PORT.to_string())])?;
    let vars = deployment::template_context(ctx, &cached, cached.workers(), false)?;
    info!("[{}] route {} through varnish", ctx.host(), app.name());
    ctx.upload_template(
        "nginx-app.conf",
        app.nginx_site(),
        context! {
            SITE => true,
            clld_dir => "",
            admin_auth => "",
            ..vars
        },
        None,
    )?;

    ctx.reload_service("nginx")
}

/// Route app past varnish again.
#[instrument(skip(ctx, app), fields(app = app.name()), level = "debug")]
pub fn uncache(ctx: &TaskContext<'_>, app: &App) -> Result<()> {
    let vars = deployment::template_context(ctx, app, app.workers(), false)?;
    let (auth, admin_auth) = deployment::http_auth(ctx, app)?;
    info!("[{}] route {} directly to gunicorn", ctx.host(), app.name());
    ctx.upload_template(
        "nginx-app.conf",
        app.nginx_site(),
        context! {
            SITE => true,
            clld_dir => "",
            auth => auth,
            admin_auth => admin_auth,
            ..vars
        },
        None,
    )?;

    ctx.reload_service("nginx")
}

/// Varnish backend definition of an app.
pub fn site_vcl(app: &App) -> String {
    format!(
        r#"backend {name} {{
    .host = "127.0.0.1";
    .port = "{port}";
}}

sub vcl_recv {{
    if (req.http.host ~ "^{domain}$")  {{ set req.backend = {name}; }}
}}

sub vcl_fetch {{
    set beresp.ttl = 3600s;
    return(deliver);
}}
"#,
        name = app.name(),
        port = app.port(),
        domain = app.domain().unwrap_or_default(),
    )
}
