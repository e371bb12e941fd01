//! Default project mounted into an empty sandbox.

use crate::error::StoreResult;
use crate::store::VirtualFileStore;
use serde_json::json;

const VITE_CONFIG: &str = "import { defineConfig } from 'vite';
import react from '@vitejs/plugin-react';

export default defineConfig({
  plugins: [react()],
  server: { host: '0.0.0.0', port: 3000, strictPort: true },
});
";

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>kiln preview</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.tsx"></script>
  </body>
</html>
"#;

const MAIN_TSX: &str = "import React from 'react';
import ReactDOM from 'react-dom/client';
import App from './App';

ReactDOM.createRoot(document.getElementById('root')!).render(
  <React.StrictMode>
    <App />
  </React.StrictMode>
);
";

const APP_TSX: &str = "import React from 'react';
import Layout from './components/Layout';

export default function App() {
  return (
    <>
      <Layout>
        <div className=\"p-8 text-center\">kiln ready</div>
      </Layout>
    </>
  );
}
";

const LAYOUT_TSX: &str = "import React, { ReactNode } from 'react';

export default function Layout({ children }: { children?: ReactNode }) {
  return <div className=\"min-h-screen\">{children}</div>;
}
";

/// `(path, content)` pairs of the seed project.
pub fn seed_files() -> Vec<(&'static str, String)> {
    let package = json!({
        "name": "kiln-preview",
        "private": true,
        "type": "module",
        "scripts": { "dev": "vite --host 0.0.0.0 --port 3000" },
        "dependencies": {
            "react": "^18.3.1",
            "react-dom": "^18.3.1",
            "@vitejs/plugin-react": "^4.3.2"
        },
        "devDependencies": {
            "vite": "^5.4.8",
            "typescript": "^5.5.4",
            "@types/react": "^18.3.3",
            "@types/react-dom": "^18.3.0"
        }
    });
    let tsconfig = json!({
        "compilerOptions": {
            "target": "ES2022",
            "module": "ESNext",
            "moduleResolution": "bundler",
            "jsx": "react-jsx",
            "strict": true,
            "esModuleInterop": true,
            "skipLibCheck": true
        }
    });

    vec![
        ("package.json", format!("{package:#}\n")),
        ("vite.config.ts", VITE_CONFIG.to_string()),
        ("tsconfig.json", format!("{tsconfig:#}\n")),
        ("index.html", INDEX_HTML.to_string()),
        ("src/main.tsx", MAIN_TSX.to_string()),
        ("src/App.tsx", APP_TSX.to_string()),
        ("src/components/Layout.tsx", LAYOUT_TSX.to_string()),
    ]
}

/// A store holding the seed project.
pub fn seed_store() -> StoreResult<VirtualFileStore> {
    VirtualFileStore::from_files(seed_files())
}

/// Replace an empty store with the seed project. Returns whether it seeded.
pub fn ensure_seeded(store: &mut VirtualFileStore) -> StoreResult<bool> {
    if !store.is_empty() {
        return Ok(false);
    }
    *store = seed_store()?;
    tracing::debug!(files = store.len(), "Seeded default project");
    Ok(true)
}
