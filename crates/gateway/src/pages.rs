//! Server-rendered pairing pages.

use std::fmt::Write as _;

use statusbot_whatsapp::{Identity, PairingView, SessionSnapshot, SessionState};

/// Escape text for use inside HTML element content and quoted attributes.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn layout(body: &str) -> String {
    format!(
        "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>Status Bot</title></head>\n\
         <body style=\"font-family:sans-serif;text-align:center\">\n{body}\n{PAIR_FORM}\n</body>\n</html>\n"
    )
}

const PAIR_FORM: &str = r#"<form id="pair" style="margin-top:2em">
  <input name="number" placeholder="Phone number with country code" required>
  <button type="submit">Get pairing code</button>
  <p id="pair-result"></p>
</form>
<script>
document.getElementById("pair").addEventListener("submit", async (ev) => {
  ev.preventDefault();
  const number = new FormData(ev.target).get("number");
  const out = document.getElementById("pair-result");
  out.textContent = "Requesting...";
  const res = await fetch("/pair?number=" + encodeURIComponent(number));
  const body = await res.json();
  if (body.code) {
    location.href = "/?number=" + encodeURIComponent(number);
  } else {
    out.textContent = body.error;
  }
});
</script>"#;

fn pairing_section(number: &str, view: &PairingView) -> String {
    let number = escape_html(number);
    match view {
        PairingView::Pending(code) => format!(
            "<h2>Enter this pairing code in your WhatsApp mobile</h2>\n\
             <h1 style=\"color:blue\">{}</h1>\n<p>{number}</p>",
            escape_html(code)
        ),
        PairingView::Connected => format!(
            "<h2>WhatsApp is connected!</h2>\n<p>{number}</p>\n\
             <p>Status viewing and auto-react enabled.</p>"
        ),
        PairingView::NotRequested => {
            format!("<h2>No pairing code requested</h2>\n<p>{number}</p>")
        },
    }
}

/// Page for one number.
pub fn render_pairing(number: &Identity, view: &PairingView) -> String {
    layout(&pairing_section(number.as_str(), view))
}

/// Page listing every known number.
pub fn render_overview(sessions: &[(Identity, SessionSnapshot)]) -> String {
    if sessions.is_empty() {
        return layout("<h2>No sessions yet</h2>\n<p>Request a pairing code below.</p>");
    }

    let mut body = String::new();
    for (identity, snapshot) in sessions {
        let view = match (&snapshot.state, &snapshot.pairing_code) {
            (SessionState::Open, _) => PairingView::Connected,
            (_, Some(code)) => PairingView::Pending(code.clone()),
            _ => PairingView::NotRequested,
        };
        let _ = write!(
            body,
            "<section>\n{}\n<p><small>{}</small></p>\n</section>\n",
            pairing_section(identity.as_str(), &view),
            escape_html(&snapshot.state.to_string())
        );
    }
    layout(&body)
}

/// Page for a malformed `?number=` query.
pub fn render_error(message: &str) -> String {
    layout(&format!("<h2>{}</h2>", escape_html(message)))
}
